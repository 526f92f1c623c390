use serde::{Deserialize, Serialize};

/// Errors.
pub mod error {
    /// The execution range could not be constructed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
    pub enum ExecutionRangeError {
        /// Work-groups must hold at least one work-item.
        #[error("work-group size must be greater than 0")]
        ZeroThreads,
        /// The padded global range does not fit in a `u32`.
        #[error("{items} items in work-groups of {threads} overflows the global range")]
        TooLarge { items: usize, threads: u32 },
    }
}
use error::ExecutionRangeError;

/** The domain of a dispatch.

A dispatch needs `items` work-items. They are launched as `groups` work-groups of
`threads` work-items each, so the global range is `items` padded up to the next
multiple of `threads`. Work-items whose global id is at or past `items` exist only
because of that padding and must not touch memory, see [`Kernel::item_id`].

```
# use vecadd_core::kernel::ExecutionRange;
let range = ExecutionRange::new(1000, 256).unwrap();
assert_eq!(range.groups(), 4);
assert_eq!(range.global_threads(), 1024);
assert_eq!(range.padding(), 24);
```
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "ExecutionRangeDesc", try_from = "ExecutionRangeDesc")]
pub struct ExecutionRange {
    items: u32,
    threads: u32,
    groups: u32,
}

// Serialized form. Deserializing goes through `ExecutionRange::new`.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct ExecutionRangeDesc {
    items: u32,
    threads: u32,
}

impl From<ExecutionRange> for ExecutionRangeDesc {
    fn from(range: ExecutionRange) -> Self {
        Self {
            items: range.items,
            threads: range.threads,
        }
    }
}

impl TryFrom<ExecutionRangeDesc> for ExecutionRange {
    type Error = ExecutionRangeError;
    fn try_from(desc: ExecutionRangeDesc) -> Result<Self, Self::Error> {
        Self::new(desc.items as usize, desc.threads)
    }
}

impl ExecutionRange {
    /// Pads `items` up to a multiple of `threads`.
    ///
    /// **errors**
    /// - `threads` is 0.
    /// - The padded range is larger than `u32::MAX`.
    pub fn new(items: usize, threads: u32) -> Result<Self, ExecutionRangeError> {
        if threads == 0 {
            return Err(ExecutionRangeError::ZeroThreads);
        }
        let too_large = ExecutionRangeError::TooLarge { items, threads };
        let groups = items.div_ceil(threads as usize);
        let global_threads = groups
            .checked_mul(threads as usize)
            .ok_or(too_large)?;
        if global_threads > u32::MAX as usize {
            return Err(too_large);
        }
        Ok(Self {
            items: items as u32,
            threads,
            groups: groups as u32,
        })
    }
    /// Work-items that do real work.
    pub fn items(&self) -> u32 {
        self.items
    }
    /// Work-items per work-group (the local range).
    pub fn threads(&self) -> u32 {
        self.threads
    }
    /// Number of work-groups.
    pub fn groups(&self) -> u32 {
        self.groups
    }
    /// Work-items launched (the global range).
    pub fn global_threads(&self) -> u32 {
        self.groups * self.threads
    }
    /// Work-items launched only to fill the last work-group.
    pub fn padding(&self) -> u32 {
        self.global_threads() - self.items
    }
    /// The work-items of group `group_id`, in local order.
    ///
    /// `group_id` must be less than [`.groups()`](Self::groups).
    pub fn group(&self, group_id: u32) -> impl ExactSizeIterator<Item = Kernel> {
        debug_assert!(group_id < self.groups);
        let range = *self;
        (0..range.threads).map(move |thread_id| Kernel {
            global_threads: range.global_threads(),
            global_id: group_id * range.threads + thread_id,
            items: range.items,
            groups: range.groups,
            group_id,
            threads: range.threads,
            thread_id,
        })
    }
    /// Every work-item of the global range, group by group.
    pub fn kernels(&self) -> impl Iterator<Item = Kernel> {
        let range = *self;
        (0..range.groups).flat_map(move |group_id| range.group(group_id))
    }
}

/// Ids of a single work-item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Kernel {
    global_threads: u32,
    global_id: u32,
    items: u32,
    groups: u32,
    group_id: u32,
    threads: u32,
    thread_id: u32,
}

impl Kernel {
    pub fn global_threads(&self) -> u32 {
        self.global_threads
    }
    pub fn global_id(&self) -> u32 {
        self.global_id
    }
    pub fn items(&self) -> u32 {
        self.items
    }
    pub fn groups(&self) -> u32 {
        self.groups
    }
    pub fn group_id(&self) -> u32 {
        self.group_id
    }
    pub fn threads(&self) -> u32 {
        self.threads
    }
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }
    /// The element this work-item owns, or `None` for padding.
    #[inline]
    pub fn item_id(&self) -> Option<usize> {
        if self.global_id < self.items {
            Some(self.global_id as usize)
        } else {
            None
        }
    }
}
