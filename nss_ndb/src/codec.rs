//! Colon-delimited passwd and group records.
//!
//! Stored values are the literal text lines the loader was fed, optionally
//! followed by the NUL byte older loaders always wrote. Decoding splits such a
//! value into fields and copies every string into an [`Arena`], so the
//! returned record borrows nothing but the caller's buffer.

use std::ffi::{c_char, CStr};
use std::fmt;
use std::ptr;

use thiserror::Error;

use crate::arena::{Arena, ArenaExhausted};

/// Oversize threshold used for single-key lookups.
pub const MAX_GETOBJ_SIZE: usize = 32768;
/// Oversize threshold used while enumerating.
pub const MAX_GETENT_SIZE: usize = 1024;

/// Stand-in member list for groups whose stored record is too large.
pub const OVERSIZED_GROUP_MEMBER: &str = "E$OVERSIZED-GROUP-USER-LIST";

const PASSWD_FIELDS: usize = 7;
const MASTER_PASSWD_FIELDS: usize = 10;
const GROUP_FIELDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Arena(#[from] ArenaExhausted),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Accept the 10 field master.passwd layout besides the 7 field one.
    pub extended_passwd: bool,
    /// Groups whose stored size reaches this many bytes get the sentinel
    /// member instead of their real member list.
    pub oversize_threshold: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            extended_passwd: master_passwd_platform(),
            oversize_threshold: MAX_GETOBJ_SIZE,
        }
    }
}

impl DecodeOptions {
    pub fn with_threshold(self, oversize_threshold: usize) -> Self {
        DecodeOptions {
            oversize_threshold,
            ..self
        }
    }
}

pub const fn master_passwd_platform() -> bool {
    cfg!(any(target_os = "freebsd", target_os = "dragonfly"))
}

#[derive(Debug, Clone, Copy)]
pub struct Passwd<'a> {
    pub name: &'a CStr,
    pub passwd: &'a CStr,
    pub uid: u32,
    pub gid: u32,
    pub class: &'a CStr,
    pub change: i64,
    pub expire: i64,
    pub gecos: &'a CStr,
    pub dir: &'a CStr,
    pub shell: &'a CStr,
    /// Number of fields in the stored record, 7 or 10.
    pub fields: usize,
}

#[derive(Clone, Copy)]
pub struct Group<'a> {
    pub name: &'a CStr,
    pub passwd: &'a CStr,
    pub gid: u32,
    // NULL terminated; every other slot points at a string in the arena.
    members: &'a [*mut c_char],
}

impl<'a> Group<'a> {
    pub fn member_count(&self) -> usize {
        self.members.len().saturating_sub(1)
    }

    pub fn members(&self) -> impl Iterator<Item = &'a CStr> + 'a {
        let members: &'a [*mut c_char] = self.members;
        members.iter().take_while(|p| !p.is_null()).map(|&p| {
            // SAFETY: non-null slots were filled from `&'a CStr`s living in
            // the same arena as the array itself.
            let member: &'a CStr = unsafe { CStr::from_ptr(p) };
            member
        })
    }

    /// The `gr_mem` array for handing to C.
    pub fn member_ptrs(&self) -> *mut *mut c_char {
        self.members.as_ptr().cast_mut()
    }

    pub fn is_oversized(&self) -> bool {
        let mut members = self.members();
        matches!(
            (members.next(), members.next()),
            (Some(m), None) if m.to_bytes() == OVERSIZED_GROUP_MEMBER.as_bytes()
        )
    }
}

impl fmt::Debug for Group<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("passwd", &self.passwd)
            .field("gid", &self.gid)
            .field("members", &self.members().collect::<Vec<_>>())
            .finish()
    }
}

fn payload(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(&[0]).unwrap_or(raw)
}

fn split_fields<'r, const N: usize>(line: &'r [u8], fields: &mut [&'r [u8]; N]) -> Result<usize, DecodeError> {
    let mut n = 0;
    for field in line.split(|b| *b == b':') {
        if n == N {
            return Err(DecodeError::Malformed("too many fields"));
        }
        fields[n] = field;
        n += 1;
    }
    Ok(n)
}

fn parse_number<T: std::str::FromStr>(field: &[u8], what: &'static str) -> Result<T, DecodeError> {
    std::str::from_utf8(field)
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('-'))
        .and_then(|s| s.parse().ok())
        .ok_or(DecodeError::Malformed(what))
}

pub fn decode_passwd<'a>(raw: &[u8], arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<Passwd<'a>, DecodeError> {
    let line = payload(raw);
    if line.contains(&0) {
        return Err(DecodeError::Malformed("embedded NUL"));
    }

    let mut f: [&[u8]; MASTER_PASSWD_FIELDS] = [&[]; MASTER_PASSWD_FIELDS];
    let fields = split_fields(line, &mut f)?;
    let extended = match fields {
        PASSWD_FIELDS => false,
        MASTER_PASSWD_FIELDS if opts.extended_passwd => true,
        _ => return Err(DecodeError::Malformed("wrong number of passwd fields")),
    };
    if f[0].is_empty() {
        return Err(DecodeError::Malformed("empty user name"));
    }

    // Every shape check happens before the first arena allocation, so a
    // malformed record leaves the arena untouched.
    let uid = parse_number(f[2], "uid is not an unsigned integer")?;
    let gid = parse_number(f[3], "gid is not an unsigned integer")?;
    let (change, expire, rest): (i64, i64, usize) = if extended {
        (
            parse_number(f[5], "change is not an unsigned integer")?,
            parse_number(f[6], "expire is not an unsigned integer")?,
            7,
        )
    } else {
        (0, 0, 4)
    };

    let name = arena.dup_bytes(f[0])?;
    let passwd = arena.dup_bytes(f[1])?;
    let class: &'a CStr = if extended { arena.dup_bytes(f[4])? } else { c"" };

    Ok(Passwd {
        name,
        passwd,
        uid,
        gid,
        class,
        change,
        expire,
        gecos: arena.dup_bytes(f[rest])?,
        dir: arena.dup_bytes(f[rest + 1])?,
        shell: arena.dup_bytes(f[rest + 2])?,
        fields,
    })
}

pub fn decode_group<'a>(raw: &[u8], arena: &mut Arena<'a>, opts: &DecodeOptions) -> Result<Group<'a>, DecodeError> {
    let line = payload(raw);
    if line.contains(&0) {
        return Err(DecodeError::Malformed("embedded NUL"));
    }

    let mut f: [&[u8]; GROUP_FIELDS] = [&[]; GROUP_FIELDS];
    if split_fields(line, &mut f)? != GROUP_FIELDS {
        return Err(DecodeError::Malformed("wrong number of group fields"));
    }
    if f[0].is_empty() {
        return Err(DecodeError::Malformed("empty group name"));
    }

    let gid = parse_number(f[2], "gid is not an unsigned integer")?;
    let name = arena.dup_bytes(f[0])?;
    let passwd = arena.dup_bytes(f[1])?;

    let members = if raw.len() < opts.oversize_threshold {
        let names = || f[3].split(|b| *b == b',').filter(|m| !m.is_empty());
        let slots = arena.alloc_array::<*mut c_char>(names().count() + 1, ptr::null_mut())?;
        for (slot, member) in slots.iter_mut().zip(names()) {
            *slot = arena.dup_bytes(member)?.as_ptr().cast_mut();
        }
        slots
    } else {
        let slots = arena.alloc_array::<*mut c_char>(2, ptr::null_mut())?;
        slots[0] = arena.dup_str(OVERSIZED_GROUP_MEMBER)?.as_ptr().cast_mut();
        slots
    };

    Ok(Group {
        name,
        passwd,
        gid,
        members,
    })
}

/// Loader side: the stored form of one input line, or `None` for blank lines
/// and comments.
pub fn encode_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        None
    } else {
        Some(line)
    }
}

/// Bytes written to the store for an accepted line, NUL included.
pub fn stored_value(line: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(line.len() + 1);
    value.extend_from_slice(line.as_bytes());
    value.push(0);
    value
}

/// Gids listed in a membership entry (`user:gid,gid,...`).
///
/// Entries without a `:` list nothing; unparsable items are skipped.
pub fn membership_gids(value: &[u8]) -> impl Iterator<Item = u32> + '_ {
    let list = payload(value)
        .iter()
        .position(|b| *b == b':')
        .map(|at| &payload(value)[at + 1..])
        .unwrap_or(&[]);
    list.split(|b| *b == b',')
        .filter(|item| !item.is_empty())
        .filter_map(|item| parse_number::<u32>(item, "gid").ok())
}

/// Builds a membership entry for `user`.
pub fn encode_membership<I>(user: &[u8], gids: I) -> Vec<u8>
where
    I: IntoIterator<Item = u32>,
{
    let mut value = user.to_vec();
    value.push(b':');
    for (i, gid) in gids.into_iter().enumerate() {
        if i > 0 {
            value.push(b',');
        }
        value.extend_from_slice(gid.to_string().as_bytes());
    }
    value.push(0);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> DecodeOptions {
        DecodeOptions {
            extended_passwd: true,
            oversize_threshold: MAX_GETOBJ_SIZE,
        }
    }

    #[test]
    fn passwd_line_decodes_field_for_field() {
        let line = "alice:x:1001:1001:Alice Liddell:/home/alice:/bin/sh";
        let stored = stored_value(encode_line(line).unwrap());
        let mut buf = [0u8; 256];
        let mut arena = Arena::new(&mut buf);
        let pw = decode_passwd(&stored, &mut arena, &opts()).unwrap();

        assert_eq!(pw.name.to_bytes(), b"alice");
        assert_eq!(pw.passwd.to_bytes(), b"x");
        assert_eq!(pw.uid, 1001);
        assert_eq!(pw.gid, 1001);
        assert_eq!(pw.gecos.to_bytes(), b"Alice Liddell");
        assert_eq!(pw.dir.to_bytes(), b"/home/alice");
        assert_eq!(pw.shell.to_bytes(), b"/bin/sh");
        assert_eq!(pw.class.to_bytes(), b"");
        assert_eq!(pw.fields, 7);
    }

    #[test]
    fn master_passwd_form_needs_opt_in() {
        let line = b"root:*:0:0:daemon:0:0:Charlie &:/root:/bin/csh";
        let mut buf = [0u8; 256];

        let pw = decode_passwd(line, &mut Arena::new(&mut buf), &opts()).unwrap();
        assert_eq!(pw.class.to_bytes(), b"daemon");
        assert_eq!(pw.shell.to_bytes(), b"/bin/csh");
        assert_eq!(pw.fields, 10);

        let seven_only = DecodeOptions {
            extended_passwd: false,
            ..opts()
        };
        let err = decode_passwd(line, &mut Arena::new(&mut buf), &seven_only).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn bad_passwd_records_are_malformed() {
        let mut buf = [0u8; 256];
        for line in [
            &b"alice:x:1001:1001:/home/alice:/bin/sh"[..],
            b"alice:x:uid:1001:A:/home/alice:/bin/sh",
            b"alice:x:1001:-1:A:/home/alice:/bin/sh",
            b"alice:x:1001:1001:A:/home/alice:/bin/sh:extra:more:fields:x",
            b":x:1:1:A:/:/bin/sh",
            b"al\0ice:x:1:1:A:/:/bin/sh",
        ] {
            let err = decode_passwd(line, &mut Arena::new(&mut buf), &opts()).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed(_)), "{:?}", line);
        }
    }

    #[test]
    fn small_buffer_reports_exhaustion_not_malformed() {
        let line = b"alice:x:1001:1001:Alice:/home/alice:/bin/sh\0";
        let mut buf = [0u8; 16];
        let err = decode_passwd(line, &mut Arena::new(&mut buf), &opts()).unwrap_err();
        assert!(matches!(err, DecodeError::Arena(_)));
    }

    #[test]
    fn group_members_keep_their_order() {
        let mut buf = [0u8; 256];
        let mut arena = Arena::new(&mut buf);
        let gr = decode_group(b"staff:x:20:carol,alice,bob\0", &mut arena, &opts()).unwrap();

        assert_eq!(gr.name.to_bytes(), b"staff");
        assert_eq!(gr.gid, 20);
        let members: Vec<_> = gr.members().map(CStr::to_bytes).collect();
        assert_eq!(members, vec![&b"carol"[..], b"alice", b"bob"]);
        assert_eq!(gr.member_count(), 3);
        assert!(!gr.is_oversized());
    }

    #[test]
    fn empty_member_list_gives_no_members() {
        let mut buf = [0u8; 128];
        let gr = decode_group(b"nogroup:*:65534:", &mut Arena::new(&mut buf), &opts()).unwrap();
        assert_eq!(gr.member_count(), 0);
        assert_eq!(gr.members().count(), 0);
        // SAFETY: the terminating slot always exists.
        assert!(unsafe { *gr.member_ptrs() }.is_null());
    }

    #[test]
    fn oversized_group_gets_sentinel_member() {
        let mut line = b"big:x:500:".to_vec();
        line.extend(b"user,".repeat(400));
        let small = opts().with_threshold(MAX_GETENT_SIZE);
        let mut buf = [0u8; 512];

        let gr = decode_group(&line, &mut Arena::new(&mut buf), &small).unwrap();
        assert!(gr.is_oversized());
        assert_eq!(gr.member_count(), 1);
        assert_eq!(gr.name.to_bytes(), b"big");
    }

    #[test]
    fn oversize_threshold_counts_the_stored_terminator() {
        let mut buf = [0u8; 256];
        for stored in [&b"staff:x:20:alice,bob\0"[..], b"staff:x:20:alice,bob"] {
            let at = opts().with_threshold(stored.len());
            let gr = decode_group(stored, &mut Arena::new(&mut buf), &at).unwrap();
            assert!(gr.is_oversized());
            assert_eq!(gr.gid, 20);

            let above = opts().with_threshold(stored.len() + 1);
            let gr = decode_group(stored, &mut Arena::new(&mut buf), &above).unwrap();
            assert!(!gr.is_oversized());
            let members: Vec<_> = gr.members().map(CStr::to_bytes).collect();
            assert_eq!(members, [&b"alice"[..], b"bob"]);
        }
    }

    #[test]
    fn group_field_count_is_exact() {
        let mut buf = [0u8; 128];
        for line in [&b"staff:x:20"[..], b"staff:x:20:a:b", b"staff:x::a"] {
            let err = decode_group(line, &mut Arena::new(&mut buf), &opts()).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed(_)));
        }
    }

    #[test]
    fn encode_skips_blank_and_comment_lines() {
        assert_eq!(encode_line("  \t "), None);
        assert_eq!(encode_line("   # comment"), None);
        assert_eq!(encode_line("  bob:x:2:2::/:/bin/sh \n"), Some("bob:x:2:2::/:/bin/sh"));
        assert_eq!(stored_value("a:b"), b"a:b\0");
    }

    #[test]
    fn membership_entries() {
        let value = encode_membership(b"alice", [20, 30]);
        assert_eq!(value, b"alice:20,30\0");
        assert_eq!(membership_gids(&value).collect::<Vec<_>>(), vec![20, 30]);
        assert_eq!(membership_gids(b"alice:20,x,,7").collect::<Vec<_>>(), vec![20, 7]);
        assert_eq!(membership_gids(b"no-colon").count(), 0);
    }
}
