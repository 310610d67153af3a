//! The bucketed page directory.
//!
//! `superblock[k]` holds a circular doubly-linked list of pages whose
//! longest free data run equals `k`. All list traversal and link/unlink
//! happens under one mutex; bitmap mutation on a detached page happens
//! without the lock, since detaching a page grants exclusive access to it.

use std::sync::Mutex;

use log::trace;

use crate::fatal;
use crate::geometry::Geometry;
use crate::page::{BmPage, DETACHED};

struct Buckets {
    slots: Vec<Option<BmPage>>,
}

pub(crate) struct Superblock {
    inner: Mutex<Buckets>,
}

impl Superblock {
    pub(crate) fn new(g: &Geometry) -> Self {
        Superblock {
            inner: Mutex::new(Buckets {
                slots: vec![None; g.max_data_units + 1],
            }),
        }
    }

    /// Inserts `page` at the tail of `superblock[k]`'s circular list.
    pub(crate) fn attach(&self, page: BmPage, k: usize) {
        let mut buckets = self.inner.lock().unwrap();
        attach_locked(&mut buckets, page, k);
        trace!("attached page {:#x} to bucket {}", page.addr(), k);
    }

    /// Removes `page` from whichever bucket it is currently linked in.
    pub(crate) fn detach(&self, page: BmPage) {
        let mut buckets = self.inner.lock().unwrap();
        detach_locked(&mut buckets, page);
    }

    /// Finds the smallest `k >= n` with a non-empty bucket, detaches its
    /// head page and returns it, or `None` if no bucket has room.
    pub(crate) fn find_and_detach(&self, g: &Geometry, n: usize) -> Option<BmPage> {
        let mut buckets = self.inner.lock().unwrap();
        for k in n..=g.max_data_units {
            if let Some(head) = buckets.slots[k] {
                detach_locked(&mut buckets, head);
                return Some(head);
            }
        }
        None
    }

    pub(crate) fn dump(&self, g: &Geometry) {
        let buckets = self.inner.lock().unwrap();
        for (k, head) in buckets.slots.iter().enumerate() {
            let Some(head) = head else { continue };
            println!("bucket {k}:");
            let mut page = *head;
            loop {
                println!("  page {:#x} {}", page.addr(), page.render(g));
                let Some(next) = page.next() else {
                    fatal!(
                        "bitmap invariant broken: page {:#x} in bucket {} missing next",
                        page.addr(),
                        k
                    );
                };
                page = next;
                if page == *head {
                    break;
                }
            }
        }
    }
}

fn attach_locked(buckets: &mut Buckets, page: BmPage, k: usize) {
    page.set_bucket(k);
    match buckets.slots[k] {
        None => {
            page.set_next(Some(page));
            page.set_prev(Some(page));
            buckets.slots[k] = Some(page);
        }
        Some(head) => {
            let Some(tail) = head.prev() else {
                fatal!(
                    "bitmap invariant broken: bucket {} head {:#x} missing prev",
                    k,
                    head.addr()
                );
            };
            tail.set_next(Some(page));
            page.set_prev(Some(tail));
            page.set_next(Some(head));
            head.set_prev(Some(page));
        }
    }
}

fn detach_locked(buckets: &mut Buckets, page: BmPage) {
    let k = page.bucket();
    if k == DETACHED {
        fatal!(
            "bitmap invariant broken: double-detach of page {:#x} not linked in any bucket",
            page.addr()
        );
    }

    let Some(next) = page.next() else {
        fatal!(
            "bitmap invariant broken: page {:#x} linked in bucket {} missing next",
            page.addr(),
            k
        );
    };
    let Some(prev) = page.prev() else {
        fatal!(
            "bitmap invariant broken: page {:#x} linked in bucket {} missing prev",
            page.addr(),
            k
        );
    };

    if next == page {
        // Sole element of its bucket.
        buckets.slots[k] = None;
    } else {
        prev.set_next(Some(next));
        next.set_prev(Some(prev));
        if buckets.slots[k] == Some(page) {
            buckets.slots[k] = Some(next);
        }
    }

    page.set_bucket(DETACHED);
    page.set_next(None);
    page.set_prev(None);
}

