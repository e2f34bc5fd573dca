use std::collections::{HashSet, VecDeque};

use cxo_skyobject::Root;
use cxo_types::Hash;
use uuid::Uuid;

/// Progress of one Root on one connection.
///
/// The filler only tracks what is still wanted; requests in flight live in
/// the connection, since the outstanding cap is per connection.
#[derive(Debug)]
pub(crate) struct Filler {
    pub(crate) root: Root,
    wants: VecDeque<Hash>,
    queued: HashSet<Hash>,
    /// Connections that already failed to fill this Root.
    pub(crate) tried: Vec<Uuid>,
}

impl Filler {
    pub(crate) fn new(root: Root, missing: Vec<Hash>, tried: Vec<Uuid>) -> Self {
        let mut filler = Self {
            root,
            wants: VecDeque::new(),
            queued: HashSet::new(),
            tried,
        };
        filler.want(missing);
        filler
    }

    /// Queue hashes to request, skipping ones already queued.
    pub(crate) fn want(&mut self, hashes: impl IntoIterator<Item = Hash>) {
        for h in hashes {
            if self.queued.insert(h) {
                self.wants.push_back(h);
            }
        }
    }

    /// Next hash to request, FIFO.
    pub(crate) fn next(&mut self) -> Option<Hash> {
        let h = self.wants.pop_front()?;
        self.queued.remove(&h);
        Some(h)
    }

    pub(crate) fn has_wants(&self) -> bool {
        !self.wants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cxo_crypto::SecretKey;

    use super::*;

    fn filler(missing: Vec<Hash>) -> Filler {
        let root = Root::sign(&SecretKey::generate(), 0, 0, Hash::blank(), Hash::sum(b"top"));
        Filler::new(root, missing, Vec::new())
    }

    #[test]
    fn wants_are_fifo_and_deduplicated() {
        let a = Hash::sum(b"a");
        let b = Hash::sum(b"b");
        let mut f = filler(vec![a, b, a]);
        f.want([b, Hash::sum(b"c")]);
        assert_eq!(f.next(), Some(a));
        assert_eq!(f.next(), Some(b));
        assert_eq!(f.next(), Some(Hash::sum(b"c")));
        assert_eq!(f.next(), None);
        assert!(!f.has_wants());
    }

    #[test]
    fn popped_hash_can_be_wanted_again() {
        let a = Hash::sum(b"a");
        let mut f = filler(vec![a]);
        assert_eq!(f.next(), Some(a));
        f.want([a]);
        assert!(f.has_wants());
    }
}
