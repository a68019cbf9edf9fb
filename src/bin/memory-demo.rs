//! Small target for trying steptrace out.
//!
//! Stores to a static array and to a heap buffer, then prints where code,
//! data and the stack live so trace addresses can be matched up by hand.
//!
//!     steptrace run -o /tmp/demo.trace target/debug/memory-demo
//!
//! Two extra workloads exercise engine corner cases:
//!
//! - `memory-demo signal` sends itself SIGUSR1 right before a marker
//!   instruction (`nop dword ptr [rax + 0x5a5a5a5a]`, encoded
//!   `0f1f805a5a5a5a`) and exits 1 unless the handler ran exactly once.
//! - `memory-demo remap` runs `mov eax, 1; ret` from an anonymous page,
//!   unmaps it, maps a fresh page at the same address and runs
//!   `mov rax, 2; ret` there. Exits with the sum of both results.

use std::hint::black_box;
use std::sync::atomic::{AtomicU32, Ordering};

static ARR: [AtomicU32; 4] = [
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
    AtomicU32::new(0),
];

static HANDLED: AtomicU32 = AtomicU32::new(0);

const FIRST_CODE: &[u8] = &[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
const SECOND_CODE: &[u8] = &[0x48, 0xc7, 0xc0, 0x02, 0x00, 0x00, 0x00, 0xc3];
const PAGE_LEN: usize = 4096;

#[inline(never)]
fn memory_stat() -> u32 {
    for (slot, value) in ARR.iter().zip([0xdead, 0xbeef, 0x1337, 0xbabe]) {
        slot.store(value, Ordering::Relaxed);
    }
    ARR[2].load(Ordering::Relaxed)
}

#[inline(never)]
fn memory_dyn() -> u32 {
    let dyn_buf: Box<[u32]> = black_box(vec![0xaaaa, 0xbbbb, 0xcccc, 0xdddd]).into_boxed_slice();
    dyn_buf[2]
}

fn memory() -> i32 {
    let s = memory_stat();
    println!("stat: {}", s);
    let d = memory_dyn();
    println!("dyn: {}", d);

    let p: usize = 0;
    println!("arr[]: {:p}", &ARR);
    println!("main: {:p}", main as fn() as *const ());
    println!("sp: {:p}", black_box(&p));
    println!("write: {:p}", libc::write as *const ());
    0
}

extern "C" fn on_usr1(_signo: libc::c_int) {
    HANDLED.fetch_add(1, Ordering::Relaxed);
}

fn signal() -> i32 {
    unsafe {
        libc::signal(
            libc::SIGUSR1,
            on_usr1 as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        // kill(getpid(), SIGUSR1) followed directly by the marker.
        std::arch::asm!(
            "syscall",
            "nop dword ptr [rax + 0x5a5a5a5a]",
            inlateout("rax") libc::SYS_kill => _,
            in("rdi") libc::getpid(),
            in("rsi") libc::SIGUSR1,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    let handled = HANDLED.load(Ordering::Relaxed);
    println!("handled: {}", handled);
    if handled == 1 {
        0
    } else {
        1
    }
}

unsafe fn map_code(hint: *mut libc::c_void, flags: libc::c_int, code: &[u8]) -> *mut libc::c_void {
    let page = libc::mmap(
        hint,
        PAGE_LEN,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
        -1,
        0,
    );
    if page != libc::MAP_FAILED {
        std::ptr::copy_nonoverlapping(code.as_ptr(), page.cast::<u8>(), code.len());
    }
    page
}

unsafe fn call(page: *mut libc::c_void) -> u64 {
    let f: extern "C" fn() -> u64 = std::mem::transmute(page);
    f()
}

fn remap() -> i32 {
    unsafe {
        let page = map_code(std::ptr::null_mut(), 0, FIRST_CODE);
        if page == libc::MAP_FAILED {
            eprintln!("mmap failed");
            return 100;
        }
        let first = call(page);
        libc::munmap(page, PAGE_LEN);

        let again = map_code(page, libc::MAP_FIXED, SECOND_CODE);
        if again != page {
            eprintln!("remap at {:p} failed", page);
            return 101;
        }
        let second = call(again);
        println!("remap: {} + {}", first, second);
        (first + second) as i32
    }
}

fn main() {
    let code = match std::env::args().nth(1).as_deref() {
        None => memory(),
        Some("signal") => signal(),
        Some("remap") => remap(),
        Some(other) => {
            eprintln!("unknown workload {:?}", other);
            2
        }
    };
    std::process::exit(code);
}
