//! Reusable buffers for outbound message construction
//!
//! Nothing here sits on the kill path. The dispatcher only leases URL
//! buffers; embeds, field lists and option maps serve the stats command and
//! the enforcement log channel.

use parking_lot::Mutex;
use serenity::all::{CreateEmbed, CreateEmbedFooter};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Vectors and strings above this capacity are not kept
pub const MAX_RETAINED_CAPACITY: usize = 1024;
/// Maps with more entries than this are not kept
pub const MAX_RETAINED_ENTRIES: usize = 64;

const MAX_IDLE: usize = 256;

/// A free list of `T`.
///
/// `recycle` resets an item on return and says whether it is worth keeping.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    create: fn() -> T,
    recycle: fn(&mut T) -> bool,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<T> Pool<T> {
    #[must_use]
    pub fn new(max_idle: usize, create: fn() -> T, recycle: fn(&mut T) -> bool) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            create,
            recycle,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Lease an item; it goes back to the pool when the lease drops
    pub fn get(&self) -> Pooled<'_, T> {
        let item = match self.idle.lock().pop() {
            Some(item) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.create)()
            }
        };
        Pooled {
            pool: self,
            item: Some(item),
        }
    }

    fn put(&self, mut item: T) {
        if !(self.recycle)(&mut item) {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// (created, reused)
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }
}

pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> Pooled<'_, T> {
    /// Keep the item instead of returning it
    #[must_use]
    pub fn detach(mut self) -> T {
        match self.item.take() {
            Some(item) => item,
            None => (self.pool.create)(),
        }
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `detach` and `drop` take the item, and both consume the lease
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

pub type EmbedField = (String, String, bool);

/// Reusable embed contents, turned into a serenity builder on send
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbedDraft {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: String,
}

impl EmbedDraft {
    pub fn field(&mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) {
        self.fields.push((name.into(), value.into(), inline));
    }

    #[must_use]
    pub fn to_embed(&self) -> CreateEmbed {
        let mut embed = CreateEmbed::new()
            .title(self.title.as_str())
            .color(self.color)
            .fields(self.fields.iter().cloned());
        if !self.description.is_empty() {
            embed = embed.description(self.description.as_str());
        }
        if !self.footer.is_empty() {
            embed = embed.footer(CreateEmbedFooter::new(self.footer.as_str()));
        }
        embed
    }
}

fn recycle_string(s: &mut String) -> bool {
    s.clear();
    s.capacity() <= MAX_RETAINED_CAPACITY
}

fn recycle_vec<T>(v: &mut Vec<T>) -> bool {
    v.clear();
    v.capacity() <= MAX_RETAINED_CAPACITY
}

fn recycle_map(m: &mut HashMap<String, String>) -> bool {
    if m.len() > MAX_RETAINED_ENTRIES {
        return false;
    }
    m.clear();
    true
}

fn recycle_embed(e: &mut EmbedDraft) -> bool {
    e.title.clear();
    e.description.clear();
    e.color = 0;
    e.footer.clear();
    recycle_vec(&mut e.fields)
}

/// The process-wide set of pools
pub struct Pools {
    pub embeds: Pool<EmbedDraft>,
    pub fields: Pool<Vec<EmbedField>>,
    pub strings: Pool<String>,
    pub option_maps: Pool<HashMap<String, String>>,
    pub string_vecs: Pool<Vec<String>>,
}

impl Default for Pools {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    #[must_use]
    pub fn new() -> Self {
        Self {
            embeds: Pool::new(MAX_IDLE, EmbedDraft::default, recycle_embed),
            fields: Pool::new(MAX_IDLE, || Vec::with_capacity(8), recycle_vec),
            strings: Pool::new(MAX_IDLE, || String::with_capacity(64), recycle_string),
            option_maps: Pool::new(MAX_IDLE, || HashMap::with_capacity(16), recycle_map),
            string_vecs: Pool::new(MAX_IDLE, || Vec::with_capacity(16), recycle_vec),
        }
    }
}
