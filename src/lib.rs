//! # foldwatch — Folding@home Client Monitor
//!
//! Connects to FAH v7 clients over their command socket, keeps a typed cache
//! of what each client reports, and rebuilds per-slot work unit history and
//! production (PPD) from it.
//!
//! ## Pipeline
//!
//! ```text
//! connection ─▶ message ─▶ store ─▶ runs ─▶ work_unit ─▶ work_unit_model ─▶ repository
//!                                                         │
//!                                       production ◀──────┘──▶ benchmark
//! ```
//!
//! [`session::ClientSession`] drives the pipeline for one client and
//! [`fleet::Fleet`] holds every session.

pub mod benchmark;
pub mod config;
pub mod connection;
pub mod db;
pub mod fleet;
pub mod log;
pub mod message;
pub mod production;
pub mod prom_metrics;
pub mod protein;
pub mod repository;
pub mod runs;
pub mod session;
pub mod slot;
pub mod store;
pub mod work_unit;
pub mod work_unit_model;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Boxed future returned by the object-safe service traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
