//! Catalog of lifecycle hooks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HookError;

/// A point in a resource's lifecycle where extensions are called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hook {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::BeforeCreate,
        Hook::AfterCreate,
        Hook::BeforeUpdate,
        Hook::AfterUpdate,
        Hook::BeforeDelete,
    ];

    /// Stable name used as tracker key and in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Hook::BeforeCreate => "BeforeCreate",
            Hook::AfterCreate => "AfterCreate",
            Hook::BeforeUpdate => "BeforeUpdate",
            Hook::AfterUpdate => "AfterUpdate",
            Hook::BeforeDelete => "BeforeDelete",
        }
    }

    /// Whether a response to this hook may hold the transition back.
    ///
    /// `After*` hooks are notifications; a retry they request is ignored.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Hook::BeforeCreate | Hook::BeforeUpdate | Hook::BeforeDelete
        )
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hook {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .into_iter()
            .find(|hook| hook.name() == s)
            .ok_or_else(|| HookError::UnknownHook(s.to_string()))
    }
}

impl From<Hook> for String {
    fn from(hook: Hook) -> Self {
        hook.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for hook in Hook::ALL {
            assert_eq!(hook.name().parse::<Hook>().unwrap(), hook);
        }
        assert!(matches!(
            "AfterDelete".parse::<Hook>(),
            Err(HookError::UnknownHook(_))
        ));
    }

    #[test]
    fn test_only_before_hooks_block() {
        let blocking: Vec<_> = Hook::ALL.into_iter().filter(Hook::is_blocking).collect();
        assert_eq!(
            blocking,
            vec![Hook::BeforeCreate, Hook::BeforeUpdate, Hook::BeforeDelete]
        );
    }
}
