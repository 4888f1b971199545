// Recent canonical block hashes, used to verify that reports and
// availability announcements reference the chain this node follows.

use posdao_core::{BlockContext, BlockHash};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const BLOCK_HISTORY_LEN: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockHistory {
    entries: VecDeque<(u64, BlockHash)>,
}

impl BlockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new head. Heights must increase; a repeated or lower height
    /// replaces everything from that height on (reorg).
    pub fn push(&mut self, ctx: &BlockContext) {
        while matches!(self.entries.back(), Some((number, _)) if *number >= ctx.number) {
            self.entries.pop_back();
        }
        self.entries.push_back((ctx.number, ctx.hash));
        while self.entries.len() > BLOCK_HISTORY_LEN {
            self.entries.pop_front();
        }
    }

    pub fn head(&self) -> Option<u64> {
        self.entries.back().map(|(number, _)| *number)
    }

    pub fn hash_at(&self, number: u64) -> Option<BlockHash> {
        let (first, _) = *self.entries.front()?;
        if number < first {
            return None;
        }
        self.entries
            .get((number - first) as usize)
            .filter(|(n, _)| *n == number)
            .map(|(_, hash)| *hash)
            .or_else(|| self.entries.iter().find(|(n, _)| *n == number).map(|(_, hash)| *hash))
    }

    /// Known and equal to the canonical hash at that height.
    pub fn matches(&self, number: u64, hash: &BlockHash) -> bool {
        self.hash_at(number).map(|h| h == *hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_window() {
        let mut history = BlockHistory::new();
        for n in 1..=300 {
            history.push(&BlockContext::synthetic(n, n * 5));
        }
        assert_eq!(history.head(), Some(300));
        assert!(history.matches(300, &BlockHash::for_number(300)));
        assert!(history.matches(45, &BlockHash::for_number(45)));
        assert!(history.hash_at(44).is_none());
        assert!(!history.matches(100, &BlockHash::for_number(101)));
    }

    #[test]
    fn test_reorg_replaces_tail() {
        let mut history = BlockHistory::new();
        for n in 1..=5 {
            history.push(&BlockContext::synthetic(n, n));
        }
        let fork = BlockContext::new(4, 4, BlockHash::digest(b"fork"));
        history.push(&fork);
        assert_eq!(history.head(), Some(4));
        assert!(history.matches(4, &BlockHash::digest(b"fork")));
        assert!(history.hash_at(5).is_none());
    }

    #[test]
    fn test_gaps_are_tolerated() {
        let mut history = BlockHistory::new();
        history.push(&BlockContext::synthetic(10, 1));
        history.push(&BlockContext::synthetic(20, 2));
        assert!(history.matches(20, &BlockHash::for_number(20)));
        assert!(history.hash_at(15).is_none());
    }
}
