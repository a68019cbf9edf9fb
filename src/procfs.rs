//! Linux procfs utilities for inspecting the tracee.
//!
//! `/proc/[pid]/maps` lists every mapping; file-backed mappings of the same
//! path are folded into one image spanning all of them. `/proc/[pid]/status`
//! tells which signals the tracee has installed handlers for.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::engine::ImageLoad;
use crate::error::Result;
use crate::types::VirtAddr;

/// A single memory region from `/proc/[pid]/maps`.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub perms: Permissions,
    pub pathname: String,
}

/// Memory region permissions (rwxp/s).
#[derive(Debug, Clone, Copy)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

/// Parse `/proc/[pid]/maps` into a list of memory regions.
pub fn read_memory_maps(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<MemoryRegion> {
    // 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.splitn(6, char::is_whitespace);

    let addr_range = parts.next()?;
    let perms_str = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("").trim().to_string();

    let (start_str, end_str) = addr_range.split_once('-')?;
    let perms = perms_str.as_bytes();
    if perms.len() < 4 {
        return None;
    }

    Some(MemoryRegion {
        start: VirtAddr(u64::from_str_radix(start_str, 16).ok()?),
        end: VirtAddr(u64::from_str_radix(end_str, 16).ok()?),
        perms: Permissions {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            private: perms[3] == b'p',
        },
        pathname,
    })
}

/// Find which memory region contains a given address.
pub fn find_region_containing(maps: &[MemoryRegion], addr: VirtAddr) -> Option<&MemoryRegion> {
    maps.iter().find(|r| addr >= r.start && addr < r.end)
}

/// Fold named mappings into images, keeping only those with executable code.
///
/// Each image spans from the lowest start to the highest end among the
/// mappings that share its pathname. Anonymous mappings are skipped.
/// Images come back ordered by low address.
pub fn executable_images(maps: &[MemoryRegion]) -> Vec<ImageLoad> {
    let mut images: Vec<(ImageLoad, bool)> = Vec::new();

    for region in maps.iter().filter(|r| !r.pathname.is_empty()) {
        match images.iter_mut().find(|(img, _)| img.name == region.pathname) {
            Some((img, executable)) => {
                img.low = img.low.min(region.start);
                img.high = img.high.max(region.end);
                *executable |= region.perms.execute;
            }
            None => images.push((
                ImageLoad {
                    name: region.pathname.clone(),
                    low: region.start,
                    high: region.end,
                },
                region.perms.execute,
            )),
        }
    }

    let mut images: Vec<ImageLoad> = images
        .into_iter()
        .filter(|(_, executable)| *executable)
        .map(|(img, _)| img)
        .collect();
    images.sort_by_key(|img| img.low);
    images
}

/// Whether the tracee has a handler installed for `signal`.
///
/// A signal with a handler diverts execution into it when delivered; an
/// ignored or default-action signal does not.
pub fn has_signal_handler(pid: Pid, signal: Signal) -> Result<bool> {
    let content = std::fs::read_to_string(format!("/proc/{}/status", pid))?;
    let caught = parse_signal_mask(&content, "SigCgt").unwrap_or(0);
    Ok(mask_contains(caught, signal))
}

/// Read a hex signal mask line such as `SigCgt:\t0000000000004a02`.
pub fn parse_signal_mask(status: &str, key: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let value = line.strip_prefix(key)?.strip_prefix(':')?;
        u64::from_str_radix(value.trim(), 16).ok()
    })
}

fn mask_contains(mask: u64, signal: Signal) -> bool {
    let bit = signal as i32 - 1;
    (0..64).contains(&bit) && mask & (1u64 << bit) != 0
}
