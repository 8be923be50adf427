//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type で型付けしています。
//! - `TaskId`: キューに積まれるタスク（永続化をまたいで安定）
//! - `VDataId`: 仮想データ（placeholder）の ID。トークン `[vd:<ulid>]` の中身
//! - `HookId`: hook インスタンスの ID（delegation の重複排除に使う）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID kind.
///
/// Display で使うプレフィックス（"task-", "vd-", "hook-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` は PhantomData なので実行時のコストはありません。
/// Serialized transparently as the bare ULID string.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Parse the bare ULID form (no prefix), as it appears inside tokens.
    pub fn parse_ulid(s: &str) -> Option<Self> {
        Ulid::from_string(s).ok().map(Self::from_ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Virtual {}

impl IdMarker for Virtual {
    fn prefix() -> &'static str {
        "vd-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {}

impl IdMarker for Hook {
    fn prefix() -> &'static str {
        "hook-"
    }
}

/// Identifier of a queued task (stable across persistence reloads).
pub type TaskId = Id<Task>;

/// Identifier of a virtual value (placeholder).
pub type VDataId = Id<Virtual>;

/// Identifier of a hook instance.
pub type HookId = Id<Hook>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);
        let vdata = VDataId::from_ulid(ulid);

        assert_eq!(task.as_ulid(), vdata.as_ulid());
        assert!(task.to_string().starts_with("task-"));
        assert!(vdata.to_string().starts_with("vd-"));
        // let _: TaskId = vdata; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let id = TaskId::from_ulid(Ulid::new());
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", id.as_ulid()));

        let back: TaskId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_ulid_roundtrip() {
        let id = VDataId::from_ulid(Ulid::new());
        assert_eq!(VDataId::parse_ulid(&id.as_ulid().to_string()), Some(id));
        assert_eq!(VDataId::parse_ulid("not-a-ulid"), None);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<VDataId>(), 16);
    }
}
