//! Common test utilities for integration tests.
//!
//! A counting stand-in for a compiled query, so tests can observe resets and
//! disposals without a database engine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlkeep_core::CompiledQuery;

/// Shared counters for every query created from one set
#[derive(Debug, Clone, Default)]
pub struct Counters {
    created: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
    disposed: Arc<AtomicUsize>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new query tied to these counters.
    pub fn query(&self) -> CountingQuery {
        self.created.fetch_add(1, Ordering::SeqCst);
        CountingQuery {
            counters: self.clone(),
            uses: 0,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Queries created but not yet disposed
    pub fn live(&self) -> usize {
        self.created() - self.disposed()
    }
}

/// A compiled query that only counts what happens to it
#[derive(Debug)]
pub struct CountingQuery {
    counters: Counters,
    /// Executions since the last reset
    pub uses: usize,
}

impl CompiledQuery for CountingQuery {
    fn reset(&mut self) {
        self.uses = 0;
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for CountingQuery {
    fn drop(&mut self) {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
