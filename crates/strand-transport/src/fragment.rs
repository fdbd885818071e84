//! # Fragmentation & Reassembly
//!
//! Oversized payloads are split into up to `max_fragments` parts of
//! `fragment_size` bytes (the last may be shorter), all shipped under one
//! sequence number. The receive side collects parts keyed by sequence and
//! reconstructs the payload once every part has arrived.
//!
//! Reassembly is defensive: a fragment that disagrees with its assembly
//! (a different total, or different bytes for an already-recorded part)
//! drops the whole assembly. Duplicates with identical bytes are ignored.
//! Assemblies that never complete are garbage-collected by age.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::wire::FragmentHeader;

// ─── Fragmenter (Send Side) ──────────────────────────────────────────────────

/// Splits payloads into bounded fragment lists.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    fragment_size: usize,
    max_fragments: usize,
}

impl Fragmenter {
    /// Create a fragmenter producing parts of `fragment_size` bytes, at most
    /// `max_fragments` per payload.
    pub fn new(fragment_size: usize, max_fragments: usize) -> Self {
        assert!(fragment_size > 0, "fragment size must be positive");
        assert!(
            (1..=u8::MAX as usize).contains(&max_fragments),
            "max fragments must fit the one-byte total field"
        );
        Fragmenter {
            fragment_size,
            max_fragments,
        }
    }

    /// Largest payload this fragmenter can carry.
    pub fn max_payload(&self) -> usize {
        self.fragment_size * self.max_fragments
    }

    /// Split `payload` into parts of `fragment_size` bytes.
    ///
    /// The slices share the payload's backing storage; no copies are made.
    pub fn split(&self, payload: &Bytes) -> Result<Vec<Bytes>> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let count = payload.len().div_ceil(self.fragment_size);
        if count > self.max_fragments {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload(),
            });
        }
        Ok((0..count)
            .map(|i| {
                let start = i * self.fragment_size;
                let end = (start + self.fragment_size).min(payload.len());
                payload.slice(start..end)
            })
            .collect())
    }
}

// ─── Assembly (Receive Side) ─────────────────────────────────────────────────

/// One in-progress reconstruction.
struct FragmentAssembly {
    total: u8,
    parts: Vec<Option<Bytes>>,
    received: u8,
    first_seen: Instant,
}

impl FragmentAssembly {
    fn new(total: u8, now: Instant) -> Self {
        FragmentAssembly {
            total,
            parts: vec![None; total as usize],
            received: 0,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total
    }

    fn concatenate(self) -> Bytes {
        let len = self.parts.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(len);
        for part in self.parts.into_iter().flatten() {
            payload.extend_from_slice(&part);
        }
        payload.freeze()
    }
}

/// Collects fragments per sequence and yields reconstructed payloads.
pub struct ReassemblyTable {
    assemblies: HashMap<u16, FragmentAssembly>,
    max_packet_size: usize,
}

impl ReassemblyTable {
    /// Create a table rejecting reconstructions larger than `max_packet_size`.
    pub fn new(max_packet_size: usize) -> Self {
        ReassemblyTable {
            assemblies: HashMap::new(),
            max_packet_size,
        }
    }

    /// Record one fragment for `sequence`.
    ///
    /// Returns `Ok(Some(payload))` when this fragment completes the assembly
    /// (which is consumed atomically), `Ok(None)` while parts are missing or
    /// the fragment was a harmless duplicate. A fragment that contradicts
    /// its assembly drops the assembly and returns the matching error.
    pub fn insert_fragment(
        &mut self,
        sequence: u16,
        header: FragmentHeader,
        part: Bytes,
        now: Instant,
    ) -> Result<Option<Bytes>> {
        let assembly = self
            .assemblies
            .entry(sequence)
            .or_insert_with(|| FragmentAssembly::new(header.total, now));

        if assembly.total != header.total {
            let expected = assembly.total;
            self.assemblies.remove(&sequence);
            return Err(Error::FragmentMismatch {
                sequence,
                expected,
                got: header.total,
            });
        }

        let idx = header.fragment_id as usize;
        match &assembly.parts[idx] {
            Some(existing) if *existing == part => return Ok(None),
            Some(_) => {
                self.assemblies.remove(&sequence);
                return Err(Error::FragmentConflict {
                    sequence,
                    fragment_id: header.fragment_id,
                });
            }
            None => {
                assembly.parts[idx] = Some(part);
                assembly.received += 1;
            }
        }

        if !assembly.is_complete() {
            return Ok(None);
        }

        let assembly = self
            .assemblies
            .remove(&sequence)
            .expect("assembly present for completed sequence");
        let payload = assembly.concatenate();
        if payload.len() > self.max_packet_size {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.max_packet_size,
            });
        }
        Ok(Some(payload))
    }

    /// Drop assemblies first seen more than `max_age` before `now`.
    /// Returns the number dropped.
    pub fn gc(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.assemblies.len();
        self.assemblies
            .retain(|_, a| now.saturating_duration_since(a.first_seen) <= max_age);
        let dropped = before - self.assemblies.len();
        if dropped > 0 {
            debug!(dropped, "expired incomplete fragment assemblies");
        }
        dropped
    }

    /// Number of in-progress assemblies.
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    /// Whether no assembly is in progress.
    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}
