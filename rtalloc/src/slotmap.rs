// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A generational arena: slots are reused after removal, but every reuse bumps the slot's
//! generation, so that IDs handed out for the previous occupant no longer resolve.

use std::{
    fmt,
    iter::{self, FusedIterator},
    marker::PhantomData,
    slice,
};

const NIL: u32 = u32::MAX;

/// The least significant bit of a generation is set while the slot is occupied.
const OCCUPIED_BIT: u32 = 1;

/// ID of a slot in a [`SlotMap`], consisting of the slot's index and its generation at the time
/// of insertion.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    #[inline]
    pub(crate) const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation() >> 1)
    }
}

/// Types that can be used as the key of a [`SlotMap`].
pub(crate) trait Key: Copy {
    fn from_id(id: SlotId) -> Self;

    fn as_id(self) -> SlotId;
}

impl Key for SlotId {
    #[inline(always)]
    fn from_id(id: SlotId) -> Self {
        id
    }

    #[inline(always)]
    fn as_id(self) -> SlotId {
        self
    }
}

/// Declares a newtype around [`SlotId`] implementing [`Key`].
macro_rules! new_key_type {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name($crate::slotmap::SlotId);

        impl $crate::slotmap::Key for $name {
            #[inline(always)]
            fn from_id(id: $crate::slotmap::SlotId) -> Self {
                $name(id)
            }

            #[inline(always)]
            fn as_id(self) -> $crate::slotmap::SlotId {
                self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use new_key_type;

pub(crate) struct SlotMap<K, V> {
    slots: Vec<Slot<V>>,
    len: u32,
    free_list_head: u32,
    marker: PhantomData<fn(K) -> K>,
}

struct Slot<V> {
    generation: u32,
    inner: SlotInner<V>,
}

enum SlotInner<V> {
    Occupied(V),
    Vacant { next_free: u32 },
}

impl<K, V> Default for SlotMap<K, V> {
    #[inline]
    fn default() -> Self {
        Self::with_key()
    }
}

impl<V> SlotMap<SlotId, V> {
    #[cfg(test)]
    #[inline]
    pub fn new() -> Self {
        Self::with_key()
    }
}

impl<K, V> SlotMap<K, V> {
    #[inline]
    pub fn with_key() -> Self {
        SlotMap {
            slots: Vec::new(),
            len: 0,
            free_list_head: NIL,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Removes all values. Slots stay reserved and their generations are bumped, so that no ID
    /// handed out before the call resolves afterward.
    pub fn clear(&mut self) {
        self.free_list_head = NIL;

        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.generation & OCCUPIED_BIT != 0 {
                slot.generation = slot.generation.wrapping_add(1);
            }

            slot.inner = SlotInner::Vacant {
                next_free: self.free_list_head,
            };
            self.free_list_head = index as u32;
        }

        self.len = 0;
    }
}

impl<K: Key, V> SlotMap<K, V> {
    pub fn insert(&mut self, value: V) -> K {
        if self.free_list_head != NIL {
            let index = self.free_list_head;
            let slot = &mut self.slots[index as usize];

            let SlotInner::Vacant { next_free } = slot.inner else {
                unreachable!("occupied slot linked into the free-list");
            };

            slot.generation = slot.generation.wrapping_add(1);
            slot.inner = SlotInner::Occupied(value);
            self.free_list_head = next_free;
            self.len += 1;

            K::from_id(SlotId {
                index,
                generation: slot.generation,
            })
        } else {
            if self.slots.len() == NIL as usize {
                capacity_overflow();
            }

            let index = self.slots.len() as u32;

            self.slots.push(Slot {
                generation: OCCUPIED_BIT,
                inner: SlotInner::Occupied(value),
            });
            self.len += 1;

            K::from_id(SlotId {
                index,
                generation: OCCUPIED_BIT,
            })
        }
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let id = key.as_id();
        let slot = self.slots.get_mut(id.index as usize)?;

        if slot.generation != id.generation {
            return None;
        }

        slot.generation = slot.generation.wrapping_add(1);

        let inner = std::mem::replace(
            &mut slot.inner,
            SlotInner::Vacant {
                next_free: self.free_list_head,
            },
        );
        self.free_list_head = id.index;
        self.len -= 1;

        match inner {
            SlotInner::Occupied(value) => Some(value),
            SlotInner::Vacant { .. } => unreachable!("occupied generation on a vacant slot"),
        }
    }

    #[inline]
    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        let id = key.as_id();
        let slot = self.slots.get(id.index as usize)?;

        match &slot.inner {
            SlotInner::Occupied(value) if slot.generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let id = key.as_id();
        let slot = self.slots.get_mut(id.index as usize)?;

        match &mut slot.inner {
            SlotInner::Occupied(value) if slot.generation == id.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            inner: self.slots.iter().enumerate(),
            marker: PhantomData,
        }
    }

    /// Removes all values, yielding them in slot order.
    pub fn drain(&mut self) -> impl Iterator<Item = V> + '_ {
        let mut values = Vec::with_capacity(self.len as usize);

        for slot in &mut self.slots {
            if let SlotInner::Occupied(_) = slot.inner {
                slot.generation = slot.generation.wrapping_add(1);

                if let SlotInner::Occupied(value) =
                    std::mem::replace(&mut slot.inner, SlotInner::Vacant { next_free: NIL })
                {
                    values.push(value);
                }
            }
        }

        self.clear();

        values.into_iter()
    }
}

#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}

pub(crate) struct Iter<'a, K, V> {
    inner: iter::Enumerate<slice::Iter<'a, Slot<V>>>,
    marker: PhantomData<fn(K) -> K>,
}

impl<'a, K: Key, V> Iterator for Iter<'a, K, V> {
    type Item = (K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, slot) = self.inner.next()?;

            if let SlotInner::Occupied(value) = &slot.inner {
                let id = SlotId {
                    index: index as u32,
                    generation: slot.generation,
                };

                break Some((K::from_id(id), value));
            }
        }
    }
}

impl<K: Key, V> FusedIterator for Iter<'_, K, V> {}
