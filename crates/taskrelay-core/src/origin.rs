//! Origin metadata carried by every task to stop delegation loops.
//!
//! An agent session that creates a task may itself have been invoked by
//! another task. The call chain records every client between the root
//! caller and the current one, and `depth` is the number of delegation
//! hops. Task creation is rejected once `depth` exceeds the configured
//! maximum, which bounds two cooperating sessions handing work back and
//! forth.

use serde::{Deserialize, Serialize};

/// Recursion-prevention metadata for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginContext {
    /// Identifier of the calling agent/session.
    pub origin_client: String,

    /// Client identifiers from the root caller to the current caller.
    pub call_chain: Vec<String>,

    /// Number of delegation hops.
    pub depth: u32,
}

impl OriginContext {
    /// Context for a caller that was not delegated by anyone.
    pub fn root(client: impl Into<String>) -> Self {
        let client = client.into();
        Self {
            call_chain: vec![client.clone()],
            origin_client: client,
            depth: 0,
        }
    }

    /// Context for `client`, called from a prior chain supplied by the
    /// session context provider.
    ///
    /// `depth` is the number of hops, i.e. the prior chain length.
    pub fn from_chain(client: impl Into<String>, prior_chain: Vec<String>) -> Self {
        let client = client.into();
        let depth = prior_chain.len() as u32;
        let mut call_chain = prior_chain;
        call_chain.push(client.clone());
        Self {
            origin_client: client,
            call_chain,
            depth,
        }
    }

    pub fn exceeds(&self, max_depth: u32) -> bool {
        self.depth > max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_context() {
        let ctx = OriginContext::root("session-a");
        assert_eq!(ctx.depth, 0);
        assert_eq!(ctx.call_chain, vec!["session-a".to_string()]);
    }

    #[test]
    fn test_from_chain_counts_hops() {
        let ctx = OriginContext::from_chain("a", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ctx.depth, 2);
        assert_eq!(ctx.origin_client, "a");
        assert_eq!(ctx.call_chain, vec!["a", "b", "a"]);
        assert!(ctx.exceeds(1));
        assert!(!ctx.exceeds(2));
    }
}
