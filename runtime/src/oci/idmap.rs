//! User and group id mapping between the host and the image.
//!
//! Ids inside layers are container ids. When a bundle is unpacked or
//! repacked by an unprivileged user, host ids are translated through the
//! configured ranges so the image does not record the caller's own uid.

use std::fmt;
use std::str::FromStr;

use casket_core::error::{CasketError, Result};
use serde::{Deserialize, Serialize};

/// A contiguous range of ids: container ids `container_id..container_id + size`
/// correspond to host ids starting at `host_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id.checked_add(offset))?
    }

    fn to_container(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        (offset < self.size).then(|| self.container_id.checked_add(offset))?
    }
}

/// Parses `<container>:<host>[:<size>]`. The size defaults to 1.
impl FromStr for IdMap {
    type Err = CasketError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            CasketError::ConfigError(format!(
                "invalid id map {:?}: expected <container>:<host>[:<size>]",
                s
            ))
        };
        let parts: Vec<&str> = s.split(':').collect();
        let number = |part: &str| part.trim().parse::<u32>().map_err(|_| invalid());

        let (container_id, host_id, size) = match parts.as_slice() {
            [container, host] => (number(container)?, number(host)?, 1),
            [container, host, size] => (number(container)?, number(host)?, number(size)?),
            _ => return Err(invalid()),
        };
        if size == 0 {
            return Err(invalid());
        }
        Ok(Self {
            container_id,
            host_id,
            size,
        })
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

/// How ownership is translated while unpacking and packing layers.
///
/// Empty maps mean ids pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapOptions {
    /// Never change ownership on the host
    pub rootless: bool,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

impl MapOptions {
    /// Build options from user supplied ranges.
    ///
    /// In rootless mode a missing map makes the invoking user (or group)
    /// appear as root inside the image.
    pub fn new(rootless: bool, mut uid_map: Vec<IdMap>, mut gid_map: Vec<IdMap>) -> Self {
        if rootless {
            if uid_map.is_empty() {
                uid_map.push(IdMap {
                    container_id: 0,
                    host_id: unsafe { libc::geteuid() },
                    size: 1,
                });
            }
            if gid_map.is_empty() {
                gid_map.push(IdMap {
                    container_id: 0,
                    host_id: unsafe { libc::getegid() },
                    size: 1,
                });
            }
        }
        Self {
            rootless,
            uid_map,
            gid_map,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.uid_map.is_empty() && self.gid_map.is_empty()
    }

    pub fn to_host_uid(&self, uid: u32) -> Result<u32> {
        translate(&self.uid_map, uid, "uid", IdMap::to_host)
    }

    pub fn to_host_gid(&self, gid: u32) -> Result<u32> {
        translate(&self.gid_map, gid, "gid", IdMap::to_host)
    }

    pub fn to_container_uid(&self, uid: u32) -> Result<u32> {
        translate(&self.uid_map, uid, "uid", IdMap::to_container)
    }

    pub fn to_container_gid(&self, gid: u32) -> Result<u32> {
        translate(&self.gid_map, gid, "gid", IdMap::to_container)
    }
}

fn translate(maps: &[IdMap], id: u32, kind: &str, f: fn(&IdMap, u32) -> Option<u32>) -> Result<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter().find_map(|map| f(map, id)).ok_or_else(|| {
        CasketError::LayerError(format!("{} {} is not covered by the {} map", kind, id, kind))
    })
}
