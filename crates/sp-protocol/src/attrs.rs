//! File attribute block (ATTRS)
//!
//! Layout (version 3):
//! ```text
//! uint32   flags
//! uint64   size            present if flags & SIZE
//! uint32   uid, gid        present if flags & UIDGID
//! uint32   permissions     present if flags & PERMISSIONS
//! uint32   atime, mtime    present if flags & ACMODTIME
//! uint32   extended_count  present if flags & EXTENDED
//! string   type, data      repeated extended_count times
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::wire;

/// File type bits of `permissions` (POSIX `st_mode`)
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;
const ATTR_EXTENDED: u32 = 0x8000_0000;

/// File attributes; every field is optional on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Create an empty attribute block
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|mode| mode & S_IFMT == S_IFDIR)
            .unwrap_or(false)
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= ATTR_EXTENDED;
        }
        flags
    }

    /// Append the wire form to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.flags());
        if let Some(size) = self.size {
            dst.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            dst.put_u32(uid);
            dst.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            dst.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            dst.put_u32(atime);
            dst.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            dst.put_u32(self.extended.len() as u32);
            for (kind, data) in &self.extended {
                wire::put_string(dst, kind);
                wire::put_string(dst, data);
            }
        }
    }

    /// Consume an attribute block from the front of `src`
    pub fn decode(src: &mut Bytes) -> Result<Self, ProtocolError> {
        let flags = wire::get_u32(src, "attribute flags")?;
        let mut attrs = Self::new();

        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(wire::get_u64(src, "size")?);
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid = Some(wire::get_u32(src, "uid")?);
            attrs.gid = Some(wire::get_u32(src, "gid")?);
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(wire::get_u32(src, "permissions")?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.atime = Some(wire::get_u32(src, "atime")?);
            attrs.mtime = Some(wire::get_u32(src, "mtime")?);
        }
        if flags & ATTR_EXTENDED != 0 {
            let count = wire::get_u32(src, "extended count")?;
            for _ in 0..count {
                let kind = wire::get_string(src, "extended type")?;
                let data = wire::get_string(src, "extended data")?;
                attrs.extended.push((kind, data));
            }
        }

        Ok(attrs)
    }
}

/// Render an `ls -l` style line for a READDIR entry
pub fn long_name(name: &str, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };

    let mut perms = String::with_capacity(10);
    perms.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    format!(
        "{} {:>4} {:<8} {:<8} {:>8} {} {}",
        perms,
        1,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        format_mtime(attrs.mtime.unwrap_or(0)),
        name
    )
}

/// Format a Unix timestamp as `Mon DD HH:MM` (UTC)
fn format_mtime(secs: u32) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = secs as i64;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (_, month, day) = civil_from_days(days);

    format!(
        "{} {:>2} {:02}:{:02}",
        MONTHS[(month - 1) as usize],
        day,
        rem / 3600,
        (rem % 3600) / 60
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}
