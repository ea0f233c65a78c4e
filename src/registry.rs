//! Shared table of roster users and their online/busy state.
//!
//! The roster is fixed at construction; a user's id is its roster index.
//! All state lives behind one mutex and every operation holds it only for a
//! few field reads or writes. A poisoned lock is reported as
//! [`RegistryError::Unavailable`] instead of exposing possibly stale data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::protocol::OnlineUser;

/// Errors returned by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry lock unavailable")]
    Unavailable,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Unknown user id: {0}")]
    UnknownId(u32),

    #[error("User already online: {0}")]
    AlreadyOnline(String),
}

/// Identifies one live connection.
///
/// Handles are unique for the life of the process, so a stale handle can
/// never match a newer connection of the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl ConnectionHandle {
    /// Allocates a fresh handle.
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: u32,
    pub username: String,
    /// `None` while offline.
    pub connection: Option<ConnectionHandle>,
    /// Set while a chat proposal involving this user is unresolved.
    pub busy: bool,
}

impl UserRecord {
    /// True if a connection owns this record.
    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }
}

/// The user table.
#[derive(Debug)]
pub struct Registry {
    users: Mutex<Vec<UserRecord>>,
}

impl Registry {
    /// Creates an offline, idle record for every roster name.
    pub fn new<S: AsRef<str>>(roster: &[S]) -> Self {
        let users = roster
            .iter()
            .enumerate()
            .map(|(i, name)| UserRecord {
                id: i as u32,
                username: name.as_ref().to_string(),
                connection: None,
                busy: false,
            })
            .collect();
        Self {
            users: Mutex::new(users),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<UserRecord>>, RegistryError> {
        self.users.lock().map_err(|_| RegistryError::Unavailable)
    }

    /// Number of roster entries.
    pub fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.lock()?.len())
    }

    /// True if the roster is empty.
    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.lock()?.is_empty())
    }

    /// Roster id of `username`.
    pub fn lookup_id_by_username(&self, username: &str) -> Result<u32, RegistryError> {
        self.lock()?
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.id)
            .ok_or_else(|| RegistryError::UnknownUser(username.to_string()))
    }

    /// Username of roster id `id`.
    pub fn lookup_username_by_id(&self, id: u32) -> Result<String, RegistryError> {
        self.lock()?
            .get(id as usize)
            .map(|u| u.username.clone())
            .ok_or(RegistryError::UnknownId(id))
    }

    /// Copy of one record.
    pub fn get(&self, id: u32) -> Result<UserRecord, RegistryError> {
        self.lock()?
            .get(id as usize)
            .cloned()
            .ok_or(RegistryError::UnknownId(id))
    }

    /// Binds `handle` to `id`, refusing if another connection owns it.
    pub fn set_online(&self, id: u32, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(id as usize)
            .ok_or(RegistryError::UnknownId(id))?;
        if user.connection.is_some() {
            return Err(RegistryError::AlreadyOnline(user.username.clone()));
        }
        user.connection = Some(handle);
        user.busy = false;
        Ok(())
    }

    /// Unconditionally clears online and busy state.
    pub fn set_offline(&self, id: u32) -> Result<(), RegistryError> {
        let mut users = self.lock()?;
        let user = users
            .get_mut(id as usize)
            .ok_or(RegistryError::UnknownId(id))?;
        user.connection = None;
        user.busy = false;
        Ok(())
    }

    /// Clears online and busy state if `handle` still owns the record.
    ///
    /// Returns whether anything was cleared.
    pub fn release(&self, id: u32, handle: ConnectionHandle) -> Result<bool, RegistryError> {
        let mut users = self.lock()?;
        match users.get_mut(id as usize) {
            Some(user) if user.connection == Some(handle) => {
                user.connection = None;
                user.busy = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// True if `id` exists and is online. Unknown ids are offline.
    pub fn is_online(&self, id: u32) -> Result<bool, RegistryError> {
        Ok(self
            .lock()?
            .get(id as usize)
            .map(UserRecord::is_online)
            .unwrap_or(false))
    }

    /// True if `id` exists and is busy.
    pub fn is_busy(&self, id: u32) -> Result<bool, RegistryError> {
        Ok(self
            .lock()?
            .get(id as usize)
            .map(|u| u.busy)
            .unwrap_or(false))
    }

    /// Atomically marks `id` busy.
    ///
    /// Succeeds only for an online user that was not already busy, so of
    /// several concurrent callers at most one gets `true`.
    pub fn try_mark_busy(&self, id: u32) -> Result<bool, RegistryError> {
        let mut users = self.lock()?;
        match users.get_mut(id as usize) {
            Some(user) if user.is_online() && !user.busy => {
                user.busy = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Clears the busy flag. Unknown ids are ignored.
    pub fn clear_busy(&self, id: u32) -> Result<(), RegistryError> {
        if let Some(user) = self.lock()?.get_mut(id as usize) {
            user.busy = false;
        }
        Ok(())
    }

    /// Snapshot of online users in roster order.
    pub fn online_users(&self) -> Result<Vec<OnlineUser>, RegistryError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|u| u.is_online())
            .map(|u| OnlineUser {
                id: u.id,
                username: u.username.clone(),
            })
            .collect())
    }
}
