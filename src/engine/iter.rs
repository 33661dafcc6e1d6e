//! Database Iterator
//!
//! Turns the merged internal-key stream of memtables and tables into the
//! user view at one sequence number: newer records are skipped, only the
//! newest visible record of each key is returned, and deletions and expired
//! records hide the key.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::{Result, StrataError};
use crate::expiry::ExpiryPolicy;
use crate::iterator::InternalIterator;
use crate::key::{LookupKey, ParsedInternalKey, SequenceNumber, ValueType};
use crate::version::Version;

/// Forward iterator over the user keys visible at a sequence number
///
/// Keeps the version it was created from alive, so tables it reads are not
/// deleted underneath it. Also usable as a plain [`Iterator`]; the first
/// `next()` starts from the first key when no seek happened.
pub struct DbIterator {
    inner: Box<dyn InternalIterator>,
    user_comparator: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    expiry: Option<Arc<dyn ExpiryPolicy>>,
    _version: Arc<Version>,

    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    positioned: bool,
    status: Option<StrataError>,
}

impl DbIterator {
    pub(crate) fn new(
        inner: Box<dyn InternalIterator>,
        user_comparator: Arc<dyn Comparator>,
        sequence: SequenceNumber,
        expiry: Option<Arc<dyn ExpiryPolicy>>,
        version: Arc<Version>,
    ) -> Self {
        Self {
            inner,
            user_comparator,
            sequence,
            expiry: expiry.filter(|e| e.expiry_activated()),
            _version: version,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            positioned: false,
            status: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// First error met while iterating, if any
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.positioned = true;
        self.inner.seek_to_first()?;
        self.find_next_user_entry(None)
    }

    /// Position at the first key >= `target`
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.positioned = true;
        let lookup = LookupKey::new(target, self.sequence);
        self.inner.seek(lookup.internal_key())?;
        self.find_next_user_entry(None)
    }

    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        // Every older record of the current key is hidden
        let skip = std::mem::take(&mut self.key);
        self.inner.next()?;
        self.find_next_user_entry(Some(skip))
    }

    fn find_next_user_entry(&mut self, mut skip: Option<Vec<u8>>) -> Result<()> {
        self.valid = false;

        while self.inner.is_valid() {
            let ikey = self.inner.key();
            let Some(parsed) = ParsedInternalKey::parse(ikey) else {
                if self.status.is_none() {
                    self.status = Some(StrataError::corruption("corrupted internal key in DbIterator"));
                }
                self.inner.next()?;
                continue;
            };

            if parsed.sequence <= self.sequence {
                let hidden = skip
                    .as_deref()
                    .map_or(false, |s| self.user_comparator.compare(parsed.user_key, s) != Ordering::Greater);

                if !hidden {
                    let expired = parsed.value_type != ValueType::Deletion
                        && self.expiry.as_ref().map_or(false, |e| e.key_retirement_callback(&parsed));

                    if parsed.value_type == ValueType::Deletion || expired {
                        skip = Some(parsed.user_key.to_vec());
                    } else {
                        self.key = parsed.user_key.to_vec();
                        self.value = self.inner.value().to_vec();
                        self.valid = true;
                        return Ok(());
                    }
                }
            }

            self.inner.next()?;
        }

        self.key.clear();
        self.value.clear();
        Ok(())
    }
}

impl Iterator for DbIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let moved = if self.positioned {
            let current = self.valid.then(|| (self.key.clone(), self.value.clone()));
            current.map(|item| (item, DbIterator::next(self)))
        } else {
            match self.seek_to_first() {
                Ok(()) => self
                    .valid
                    .then(|| (self.key.clone(), self.value.clone()))
                    .map(|item| (item, DbIterator::next(self))),
                Err(e) => {
                    self.status = Some(e);
                    None
                }
            }
        };

        let (item, advanced) = moved?;
        if let Err(e) = advanced {
            self.status = Some(e);
            self.valid = false;
        }
        Some(item)
    }
}
