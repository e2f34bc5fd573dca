//! Editing a feed's object tree.

use std::fmt;

use chrono::Utc;
use cxo_crypto::{PubKey, SecretKey};
use cxo_registry::codec::{decode_values, encode_values};
use cxo_registry::{Batch, Dynamic, Object, RegistryError, Sealer, Value};
use cxo_types::Hash;
use tracing::debug;

use crate::container::Container;
use crate::error::{ObjectError, ObjectResult};
use crate::root::Root;

/// A working view over a Root's object graph.
///
/// The top level of a tree is an ordered list of [`Dynamic`] references.
/// Objects are decoded on first access and edits are tracked per handle,
/// so [`save`](Pack::save) re-encodes only what changed. A Pack opened
/// without the feed's secret key is view-only.
pub struct Pack {
    container: Container,
    pub_key: PubKey,
    secret: Option<SecretKey>,
    root: Option<Root>,
    items: Vec<Dynamic>,
}

impl Container {
    /// A Pack over the newest Root of the feed owned by `secret`, or an
    /// empty one for a new feed. The feed is tracked if it was not already.
    pub fn create_pack(&self, secret: &SecretKey) -> ObjectResult<Pack> {
        let pub_key = secret.pub_key();
        self.add_feed(pub_key)?;
        match self.last_root(&pub_key) {
            Some(root) => self.unpack(&root, Some(secret)),
            None => Ok(Pack {
                container: self.clone(),
                pub_key,
                secret: Some(secret.clone()),
                root: None,
                items: Vec::new(),
            }),
        }
    }

    /// Open a Pack over `root`. Without `secret` the Pack is view-only.
    pub fn unpack(&self, root: &Root, secret: Option<&SecretKey>) -> ObjectResult<Pack> {
        if let Some(sk) = secret {
            if sk.pub_key() != root.pub_key {
                return Err(ObjectError::WrongKey(root.pub_key));
            }
        }
        let bytes = self
            .get(&root.hash)?
            .ok_or(RegistryError::Missing(root.hash))?;
        let items = decode_values(&bytes)
            .map_err(|_| ObjectError::MalformedRoot(root.hash))?
            .into_iter()
            .map(|value| match value {
                Value::Dynamic(d) => Ok(d),
                _ => Err(ObjectError::MalformedRoot(root.hash)),
            })
            .collect::<ObjectResult<Vec<_>>>()?;

        Ok(Pack {
            container: self.clone(),
            pub_key: root.pub_key,
            secret: secret.cloned(),
            root: Some(root.clone()),
            items,
        })
    }
}

impl Pack {
    pub fn pub_key(&self) -> &PubKey {
        &self.pub_key
    }

    /// The Root this Pack was opened from or last saved.
    pub fn root(&self) -> Option<&Root> {
        self.root.as_ref()
    }

    pub fn is_view_only(&self) -> bool {
        self.secret.is_none()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Top-level handles, in order.
    pub fn items(&self) -> &[Dynamic] {
        &self.items
    }

    fn writable(&self) -> ObjectResult<()> {
        if self.is_view_only() {
            return Err(ObjectError::ViewOnly);
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> ObjectResult<()> {
        if index >= self.items.len() {
            return Err(RegistryError::OutOfRange {
                index,
                len: self.items.len(),
            }
            .into());
        }
        Ok(())
    }

    /// The object at `index`, loading it if needed. `None` for a blank
    /// handle.
    pub fn get(&mut self, index: usize) -> ObjectResult<Option<&Object>> {
        self.check_index(index)?;
        Ok(self.items[index].load(&self.container)?)
    }

    /// The object at `index` for editing. Its new content is encoded by the
    /// next save.
    pub fn get_mut(&mut self, index: usize) -> ObjectResult<Option<&mut Object>> {
        self.writable()?;
        self.check_index(index)?;
        Ok(self.items[index].load_mut(&self.container)?)
    }

    pub fn append(&mut self, object: Object) -> ObjectResult<()> {
        self.writable()?;
        self.items.push(Dynamic::new(object));
        Ok(())
    }

    pub fn set_ref_by_index(&mut self, index: usize, object: Object) -> ObjectResult<()> {
        self.writable()?;
        self.check_index(index)?;
        self.items[index].set(object);
        Ok(())
    }

    /// Replace the whole top-level list.
    pub fn replace(&mut self, items: Vec<Dynamic>) -> ObjectResult<()> {
        self.writable()?;
        self.items = items;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> ObjectResult<Dynamic> {
        self.writable()?;
        self.check_index(index)?;
        Ok(self.items.remove(index))
    }

    /// Encode what changed, sign the new top and commit it as the next Root
    /// of the feed.
    ///
    /// Old Roots keep their references until they are pruned, so objects
    /// dropped from the tree are reclaimed by the prune, not by the save.
    pub fn save(&mut self) -> ObjectResult<Root> {
        let secret = self.secret.as_ref().ok_or(ObjectError::ViewOnly)?;

        let mut batch = Batch::new();
        {
            let mut sealer = Sealer::new(
                self.container.registry(),
                self.container.config().refs_degree,
                &mut batch,
            );
            for item in &mut self.items {
                item.seal(&mut sealer)?;
            }
        }
        let sealed = batch.len();

        let values: Vec<Value> = self
            .items
            .iter()
            .map(|d| Value::Dynamic(Dynamic::from_parts(d.schema(), d.hash())))
            .collect();
        let top = encode_values(&values)?;
        let hash = Hash::sum(&top);
        batch.insert(hash, top);

        let (seq, prev) = match self.container.last_root(&self.pub_key) {
            Some(last) => (last.seq + 1, last.digest()),
            None => (0, Hash::blank()),
        };
        let time = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let root = Root::sign(secret, seq, time, prev, hash);

        self.container.commit(&root, &batch)?;
        debug!(root = %root, sealed, "pack saved");
        self.root = Some(root.clone());
        Ok(root)
    }
}

impl fmt::Debug for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pack")
            .field("feed", &self.pub_key.short_hex())
            .field("root", &self.root.as_ref().map(Root::short))
            .field("items", &self.items.len())
            .field("view_only", &self.is_view_only())
            .finish()
    }
}
