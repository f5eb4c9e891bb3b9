//! The name service switch boundary.
//!
//! Exported functions unpack the raw C arguments into a [`Request`], run it
//! against this thread's [`Lookup`] and write the [`Reply`] back into the
//! caller's `struct passwd` or `struct group`. Nothing below this module
//! sees a raw pointer except the arena.
//!
//! The symbols follow glibc's `_nss_<service>_<call>` convention. On FreeBSD
//! and DragonFly, `nsdispatch` passes its arguments as a `va_list`, which
//! stable Rust cannot consume; the C method table registered by
//! [`nsdispatch`](crate::nsdispatch) unpacks them and calls these same
//! functions (`getgroupmembership` already has the BSD shape).

#![allow(clippy::missing_safety_doc)]

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_long, c_void, CStr};
use std::mem::{size_of, MaybeUninit};
use std::slice;

use libc::{gid_t, size_t, uid_t};

use crate::arena::Arena;
use crate::codec::{Group, Passwd};
use crate::config::Config;
use crate::lookup::{Lookup, LookupError};
use crate::membership::{Added, BoundedGroups, GroupSink, MembershipReport};
use crate::status::NssStatus;

lazy_static! {
    static ref CONFIG: Config = {
        let config = Config::load();
        crate::log::set_debug(config.debug);
        config
    };
}

thread_local! {
    static LOOKUP: RefCell<Option<Lookup>> = const { RefCell::new(None) };
}

pub enum Request<'r> {
    PasswdByName(&'r [u8]),
    PasswdByUid(u32),
    PasswdBegin { stay_open: bool },
    PasswdNext,
    PasswdEnd,
    GroupByName(&'r [u8]),
    GroupByGid(u32),
    GroupBegin { stay_open: bool },
    GroupNext,
    GroupEnd,
    Membership {
        name: &'r [u8],
        primary: Option<u32>,
        sink: &'r mut dyn GroupSink,
    },
}

#[derive(Debug)]
pub enum Reply<'a> {
    Passwd(Passwd<'a>),
    Group(Group<'a>),
    Membership(MembershipReport),
    Done,
}

impl Reply<'_> {
    pub fn status(&self) -> NssStatus {
        match self {
            // Membership always lets the next source add its groups too.
            Reply::Membership(_) => NssStatus::NotFound,
            _ => NssStatus::Success,
        }
    }
}

/// Runs one request against an explicit lookup context.
pub fn serve<'a>(lookup: &mut Lookup, request: Request<'_>, arena: &mut Arena<'a>) -> Result<Reply<'a>, LookupError> {
    Ok(match request {
        Request::PasswdByName(name) => Reply::Passwd(lookup.getpwnam(name, arena)?),
        Request::PasswdByUid(uid) => Reply::Passwd(lookup.getpwuid(uid, arena)?),
        Request::PasswdBegin { stay_open } => {
            lookup.setpwent(stay_open)?;
            Reply::Done
        }
        Request::PasswdNext => Reply::Passwd(lookup.getpwent(arena)?),
        Request::PasswdEnd => {
            lookup.endpwent();
            Reply::Done
        }
        Request::GroupByName(name) => Reply::Group(lookup.getgrnam(name, arena)?),
        Request::GroupByGid(gid) => Reply::Group(lookup.getgrgid(gid, arena)?),
        Request::GroupBegin { stay_open } => {
            lookup.setgrent(stay_open)?;
            Reply::Done
        }
        Request::GroupNext => Reply::Group(lookup.getgrent(arena)?),
        Request::GroupEnd => {
            lookup.endgrent();
            Reply::Done
        }
        Request::Membership { name, primary, sink } => Reply::Membership(lookup.group_membership(name, primary, sink)?),
    })
}

/// Runs one request against the calling thread's lookup context, creating
/// it on first use.
pub fn dispatch<'a>(request: Request<'_>, arena: &mut Arena<'a>) -> Result<Reply<'a>, LookupError> {
    LOOKUP
        .try_with(|slot| {
            let Ok(mut slot) = slot.try_borrow_mut() else {
                debug!("reentrant lookup refused");
                return Err(LookupError::NotFound);
            };
            let lookup = slot.get_or_insert_with(|| Lookup::new(&CONFIG));
            serve(lookup, request, arena)
        })
        .unwrap_or(Err(LookupError::NotFound))
}

fn report(errnop: *mut c_int, status: NssStatus, errno: Option<c_int>) -> c_int {
    if let Some(errno) = errno {
        if !errnop.is_null() {
            unsafe { *errnop = errno };
        }
    }
    status.code()
}

fn failed(errnop: *mut c_int, e: &LookupError) -> c_int {
    report(errnop, e.status(), Some(e.errno()))
}

fn invalid(errnop: *mut c_int) -> c_int {
    report(errnop, NssStatus::Unavail, Some(libc::EINVAL))
}

fn fill_passwd(out: &mut libc::passwd, pw: &Passwd<'_>) {
    out.pw_name = pw.name.as_ptr().cast_mut();
    out.pw_passwd = pw.passwd.as_ptr().cast_mut();
    out.pw_uid = pw.uid;
    out.pw_gid = pw.gid;
    out.pw_gecos = pw.gecos.as_ptr().cast_mut();
    out.pw_dir = pw.dir.as_ptr().cast_mut();
    out.pw_shell = pw.shell.as_ptr().cast_mut();
    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    {
        out.pw_class = pw.class.as_ptr().cast_mut();
        out.pw_change = pw.change as libc::time_t;
        out.pw_expire = pw.expire as libc::time_t;
        out.pw_fields = pw.fields as c_int;
    }
}

fn fill_group(out: &mut libc::group, gr: &Group<'_>) {
    out.gr_name = gr.name.as_ptr().cast_mut();
    out.gr_passwd = gr.passwd.as_ptr().cast_mut();
    out.gr_gid = gr.gid;
    out.gr_mem = gr.member_ptrs();
}

unsafe fn passwd_call(
    request: Request<'_>,
    result: *mut libc::passwd,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    if result.is_null() {
        return invalid(errnop);
    }
    let mut arena = unsafe { Arena::from_raw(buffer.cast(), buflen) };
    match dispatch(request, &mut arena) {
        Ok(Reply::Passwd(pw)) => {
            fill_passwd(unsafe { &mut *result }, &pw);
            NssStatus::Success.code()
        }
        Ok(_) => report(errnop, NssStatus::NotFound, Some(libc::ENOENT)),
        Err(e) => failed(errnop, &e),
    }
}

unsafe fn group_call(
    request: Request<'_>,
    result: *mut libc::group,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    if result.is_null() {
        return invalid(errnop);
    }
    let mut arena = unsafe { Arena::from_raw(buffer.cast(), buflen) };
    match dispatch(request, &mut arena) {
        Ok(Reply::Group(gr)) => {
            fill_group(unsafe { &mut *result }, &gr);
            NssStatus::Success.code()
        }
        Ok(_) => report(errnop, NssStatus::NotFound, Some(libc::ENOENT)),
        Err(e) => failed(errnop, &e),
    }
}

fn control(request: Request<'_>) -> c_int {
    let mut arena = Arena::from_uninit(&mut []);
    match dispatch(request, &mut arena) {
        Ok(reply) => reply.status().code(),
        Err(e) => e.status().code(),
    }
}

unsafe fn name_arg<'n>(name: *const c_char) -> Option<&'n [u8]> {
    if name.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(name) }.to_bytes())
    }
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getpwnam_r(
    name: *const c_char,
    result: *mut libc::passwd,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    match unsafe { name_arg(name) } {
        Some(name) => unsafe { passwd_call(Request::PasswdByName(name), result, buffer, buflen, errnop) },
        None => invalid(errnop),
    }
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getpwuid_r(
    uid: uid_t,
    result: *mut libc::passwd,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    unsafe { passwd_call(Request::PasswdByUid(uid), result, buffer, buflen, errnop) }
}

/// glibc passes no stay-open flag, so enumeration sessions always stay open
/// until `endpwent`.
#[no_mangle]
pub extern "C" fn _nss_ndb_setpwent() -> c_int {
    control(Request::PasswdBegin { stay_open: true })
}

/// `setpassent(3)`: with `stayopen` zero the index is released after every
/// enumeration step and reopened at the same position on the next.
#[no_mangle]
pub extern "C" fn _nss_ndb_setpassent(stayopen: c_int) -> c_int {
    control(Request::PasswdBegin {
        stay_open: stayopen != 0,
    })
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getpwent_r(
    result: *mut libc::passwd,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    unsafe { passwd_call(Request::PasswdNext, result, buffer, buflen, errnop) }
}

#[no_mangle]
pub extern "C" fn _nss_ndb_endpwent() -> c_int {
    control(Request::PasswdEnd)
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getgrnam_r(
    name: *const c_char,
    result: *mut libc::group,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    match unsafe { name_arg(name) } {
        Some(name) => unsafe { group_call(Request::GroupByName(name), result, buffer, buflen, errnop) },
        None => invalid(errnop),
    }
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getgrgid_r(
    gid: gid_t,
    result: *mut libc::group,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    unsafe { group_call(Request::GroupByGid(gid), result, buffer, buflen, errnop) }
}

#[no_mangle]
pub extern "C" fn _nss_ndb_setgrent() -> c_int {
    control(Request::GroupBegin { stay_open: true })
}

#[no_mangle]
pub extern "C" fn _nss_ndb_setgroupent(stayopen: c_int) -> c_int {
    control(Request::GroupBegin {
        stay_open: stayopen != 0,
    })
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getgrent_r(
    result: *mut libc::group,
    buffer: *mut c_char,
    buflen: size_t,
    errnop: *mut c_int,
) -> c_int {
    unsafe { group_call(Request::GroupNext, result, buffer, buflen, errnop) }
}

#[no_mangle]
pub extern "C" fn _nss_ndb_endgrent() -> c_int {
    control(Request::GroupEnd)
}

/// glibc's growable group array: `(*groupsp)[..*start]` is filled,
/// `*size` slots are allocated, and a positive `limit` caps the growth.
struct GrowableGroups<'g> {
    start: &'g mut c_long,
    size: &'g mut c_long,
    groups: &'g mut *mut gid_t,
    limit: c_long,
    // glibc has already stored the primary group.
    primary: gid_t,
    out_of_memory: bool,
}

impl GrowableGroups<'_> {
    fn filled(&self) -> &[gid_t] {
        let len = usize::try_from(*self.start).unwrap_or(0);
        if self.groups.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: glibc guarantees the first `*start` slots are initialized.
        unsafe { slice::from_raw_parts(*self.groups, len) }
    }

    fn grow(&mut self) -> bool {
        let size = *self.size;
        if self.limit > 0 && size >= self.limit {
            return false;
        }
        let mut wanted = size.saturating_mul(2).max(16);
        if self.limit > 0 {
            wanted = wanted.min(self.limit);
        }
        let Ok(slots) = usize::try_from(wanted) else {
            return false;
        };
        // SAFETY: `*groups` was allocated by glibc with malloc (or is null).
        let grown = unsafe { libc::realloc((*self.groups).cast::<c_void>(), slots * size_of::<gid_t>()) };
        if grown.is_null() {
            self.out_of_memory = true;
            return false;
        }
        *self.groups = grown.cast::<gid_t>();
        *self.size = wanted;
        true
    }
}

impl GroupSink for GrowableGroups<'_> {
    fn add(&mut self, gid: u32) -> Added {
        if gid == self.primary || self.filled().contains(&gid) {
            return Added::Duplicate;
        }
        if *self.start >= *self.size && !self.grow() {
            return Added::Overflow;
        }
        let Ok(at) = usize::try_from(*self.start) else {
            return Added::Overflow;
        };
        // SAFETY: `at < *size`, the allocated length of `*groups`.
        unsafe { (*self.groups).add(at).write(gid) };
        *self.start += 1;
        Added::Inserted
    }
}

#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_initgroups_dyn(
    user: *const c_char,
    group: gid_t,
    start: *mut c_long,
    size: *mut c_long,
    groupsp: *mut *mut gid_t,
    limit: c_long,
    errnop: *mut c_int,
) -> c_int {
    let Some(name) = (unsafe { name_arg(user) }) else {
        return invalid(errnop);
    };
    if start.is_null() || size.is_null() || groupsp.is_null() {
        return invalid(errnop);
    }
    let mut sink = GrowableGroups {
        start: unsafe { &mut *start },
        size: unsafe { &mut *size },
        groups: unsafe { &mut *groupsp },
        limit,
        primary: group,
        out_of_memory: false,
    };
    let request = Request::Membership {
        name,
        primary: None,
        sink: &mut sink,
    };
    match dispatch(request, &mut Arena::from_uninit(&mut [])) {
        Ok(_) if sink.out_of_memory => report(errnop, NssStatus::TryAgain, Some(libc::ENOMEM)),
        Ok(reply) => report(errnop, reply.status(), Some(libc::ENOENT)),
        Err(e) => failed(errnop, &e),
    }
}

/// `getgrouplist(3)` in the BSD shape: `*groupc` slots of `groups` are
/// already filled, `maxgrp` is the capacity, and on return `*groupc` counts
/// every distinct gid offered, including the ones that did not fit.
#[no_mangle]
pub unsafe extern "C" fn _nss_ndb_getgroupmembership(
    name: *const c_char,
    primary: gid_t,
    groups: *mut gid_t,
    maxgrp: c_int,
    groupc: *mut c_int,
) -> c_int {
    let Some(name) = (unsafe { name_arg(name) }) else {
        return NssStatus::Unavail.code();
    };
    if groupc.is_null() {
        return NssStatus::Unavail.code();
    }
    let capacity = if groups.is_null() { 0 } else { usize::try_from(maxgrp).unwrap_or(0) };
    let slots: &mut [MaybeUninit<gid_t>] = if capacity == 0 {
        &mut []
    } else {
        unsafe { slice::from_raw_parts_mut(groups.cast::<MaybeUninit<gid_t>>(), capacity) }
    };
    let filled = usize::try_from(unsafe { *groupc }).unwrap_or(0);
    // SAFETY: the caller initialized the first `*groupc` entries.
    let mut sink = unsafe { BoundedGroups::from_uninit_with(slots, filled) };

    let request = Request::Membership {
        name,
        primary: Some(primary),
        sink: &mut sink,
    };
    let status = match dispatch(request, &mut Arena::from_uninit(&mut [])) {
        Ok(reply) => reply.status(),
        Err(e) => e.status(),
    };
    // Entries the caller counted beyond its own capacity stay counted.
    let carried = filled.saturating_sub(capacity);
    unsafe { *groupc = c_int::try_from(sink.count() + carried).unwrap_or(c_int::MAX) };
    status.code()
}
