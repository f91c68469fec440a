//! In-memory item store served by the daemon out of the box.
//!
//! `get` functions: `item(id)`, `list()` (prefetches every item).
//! `set` functions: `put(id, value)`, `touch(id)`, `remove(id)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::{json, Value};
use wsapi_core::{arg, Definition, GetReturn, SetReturn};

const LIST_TAG: &str = "items";

fn item_tag(id: u64) -> String {
    format!("item:{id}")
}

#[derive(Debug, Clone)]
struct Item {
    value: Value,
    rev: u64,
}

/// Items keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ItemStore {
    items: Arc<Mutex<BTreeMap<u64, Item>>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with a couple of items to play with.
    pub fn seeded() -> Self {
        let store = Self::new();
        store.put(1, json!("first"));
        store.put(2, json!("second"));
        store
    }

    pub fn put(&self, id: u64, value: Value) -> bool {
        let mut items = self.items.lock();
        let created = !items.contains_key(&id);
        let item = items.entry(id).or_insert(Item {
            value: Value::Null,
            rev: 0,
        });
        item.value = value;
        item.rev += 1;
        created
    }

    pub fn touch(&self, id: u64) -> Option<u64> {
        let mut items = self.items.lock();
        let item = items.get_mut(&id)?;
        item.rev += 1;
        Some(item.rev)
    }

    pub fn remove(&self, id: u64) -> bool {
        self.items.lock().remove(&id).is_some()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.items.lock().keys().copied().collect()
    }

    fn render(&self, id: u64) -> Value {
        match self.items.lock().get(&id) {
            Some(item) => json!({ "id": id, "value": item.value, "rev": item.rev }),
            None => Value::Null,
        }
    }

    /// Query functions over this store.
    pub fn definition(&self) -> Definition {
        let get_item = self.clone();
        let list = self.clone();
        let put = self.clone();
        let touch = self.clone();
        let remove = self.clone();

        Definition::new()
            .get("item", move |args: Vec<Value>| {
                let store = get_item.clone();
                async move {
                    let id: u64 = arg(&args, 0)?;
                    Ok(GetReturn::new(store.render(id)).tag(item_tag(id)))
                }
            })
            .get("list", move |_args: Vec<Value>| {
                let store = list.clone();
                async move {
                    let ids = store.ids();
                    let mut ret = GetReturn::new(json!(ids)).tag(LIST_TAG);
                    for id in ids {
                        ret = ret.prepare_call("item", vec![json!(id)]);
                    }
                    Ok(ret)
                }
            })
            .set("put", move |args: Vec<Value>| {
                let store = put.clone();
                async move {
                    let id: u64 = arg(&args, 0)?;
                    let value: Value = arg(&args, 1)?;
                    let mut ret = SetReturn::new(json!(id)).invalidate(item_tag(id));
                    if store.put(id, value) {
                        ret = ret.invalidate(LIST_TAG);
                    }
                    Ok(ret)
                }
            })
            .set("touch", move |args: Vec<Value>| {
                let store = touch.clone();
                async move {
                    let id: u64 = arg(&args, 0)?;
                    store.touch(id).ok_or_else(|| anyhow!("no item {id}"))?;
                    Ok(SetReturn::new(json!(true)).invalidate(item_tag(id)))
                }
            })
            .set("remove", move |args: Vec<Value>| {
                let store = remove.clone();
                async move {
                    let id: u64 = arg(&args, 0)?;
                    let removed = store.remove(id);
                    let mut ret = SetReturn::new(json!(removed));
                    if removed {
                        ret = ret.invalidate(item_tag(id)).invalidate(LIST_TAG);
                    }
                    Ok(ret)
                }
            })
    }
}
