//! Shared fixtures: a small machine, an in-memory file system holding
//! ELF32 images and a recording scheduler/interrupt controller.

#![allow(dead_code)]

use kernel::proc::Pid;
use kernel::trap::{T_PGFLT, T_SYSCALL};
use kernel::{Cpu, FileSystem, Inode, InterruptController, Irq, Kernel, ProcState, Process, Scheduler, TrapFrame};
use kernel_alloc::frame_alloc::RamFrames;
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame, VirtualAddress};
use kernel_vmem::TranslationCache;
use std::collections::BTreeMap;

/// 1 GiB of user space, 4 MiB of physical memory, a four-page stack cap and
/// at most eight arguments.
pub const LAYOUT: MemoryLayout = MemoryLayout {
    kernel_base: 0x4000_0000,
    ext_mem: 0x0010_0000,
    kernel_data: 0x4020_0000,
    phys_top: 0x0040_0000,
    dev_space: 0xFFFF_F000,
    max_stack_size: 4 * PAGE_SIZE,
    max_args: 8,
};

pub const RAM_FIRST_FRAME: u32 = 0x100;
pub const RAM_FRAMES: u32 = 128;

/// Entry point of every test program: 16 bytes into its text.
pub const ENTRY: u32 = 0x10;
/// Bytes the test programs carry in the file.
pub const CODE: &[u8] = b"\x90\x90\x90\x90init\xcc\xcc\xcc\xcc\xcc\xcc\xcc\xcc";
/// Uninitialized data after the code.
pub const BSS: u32 = 0x1000;

/// With `CODE` and `BSS`: text+data ends at 0x1010, two pages, so the
/// stack window is `[0x2000, 0x7000)`.
pub const TEXT_END: u32 = 0x1010;
pub const STACK_START: u32 = 0x6000;
pub const STACK_TOP: u32 = 0x7000;
pub const GUARD: u32 = 0x5000;

/// Frames an image of the test program occupies: directory, one page
/// table, two text pages and one stack page.
pub const IMAGE_FRAMES: usize = 5;

/// Handler and restore routine addresses used by alarm tests.
pub const HANDLER: u32 = 0x0100;
pub const RESTORE: u32 = 0x0200;

pub const USER_WRITE: u32 = 0b110;
pub const USER_WRITE_PRESENT: u32 = 0b111;
pub const USER_READ: u32 = 0b100;

/// An ELF32 executable with a single loadable segment at address 0.
pub fn elf_image(code: &[u8], bss: u32, entry: u32) -> Vec<u8> {
    let code_len = u32::try_from(code.len()).unwrap();
    let mut image = vec![0u8; 84];
    image[0..4].copy_from_slice(b"\x7FELF");
    image[4] = 1; // ELFCLASS32
    image[5] = 1; // little-endian
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..28].copy_from_slice(&entry.to_le_bytes());
    image[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
    image[40..42].copy_from_slice(&52u16.to_le_bytes()); // e_ehsize
    image[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
    image[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    let ph = &mut image[52..84];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&84u32.to_le_bytes()); // p_offset
    ph[8..12].copy_from_slice(&0u32.to_le_bytes()); // p_vaddr
    ph[16..20].copy_from_slice(&code_len.to_le_bytes());
    ph[20..24].copy_from_slice(&(code_len + bss).to_le_bytes());
    ph[24..28].copy_from_slice(&7u32.to_le_bytes()); // RWX

    image.extend_from_slice(code);
    image
}

#[derive(Default)]
pub struct MemFs {
    names: BTreeMap<String, u32>,
    files: Vec<Vec<u8>>,
}

impl MemFs {
    pub fn add(&mut self, path: &str, bytes: Vec<u8>) {
        let node = u32::try_from(self.files.len()).unwrap();
        self.files.push(bytes);
        self.names.insert(path.to_owned(), node);
    }
}

impl FileSystem for MemFs {
    fn find_file(&mut self, path: &str) -> Option<Inode> {
        self.names.get(path).copied().map(Inode)
    }

    fn read_file(&mut self, node: Inode, buf: &mut [u8], offset: u32) -> usize {
        let file = &self.files[node.0 as usize];
        let start = (offset as usize).min(file.len());
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        n
    }
}

/// File system plus recording scheduler and interrupt controller.
#[derive(Default)]
pub struct Env {
    pub fs: MemFs,
    pub exited: Vec<Pid>,
    pub yields: usize,
    pub wakeups: Vec<u32>,
    pub spawned: Vec<(Process, TrapFrame)>,
    pub eoi: Vec<usize>,
    pub devices: Vec<Irq>,
}

impl Env {
    /// An environment whose file system holds the test program at
    /// `/init` and `/bin/echo`.
    pub fn with_programs() -> Self {
        let mut env = Self::default();
        env.fs.add("/init", elf_image(CODE, BSS, ENTRY));
        env.fs.add("/bin/echo", elf_image(CODE, BSS, ENTRY));
        env
    }
}

impl FileSystem for Env {
    fn find_file(&mut self, path: &str) -> Option<Inode> {
        self.fs.find_file(path)
    }

    fn read_file(&mut self, node: Inode, buf: &mut [u8], offset: u32) -> usize {
        self.fs.read_file(node, buf, offset)
    }
}

impl Scheduler for Env {
    fn exit(&mut self, proc: &mut Process) {
        self.exited.push(proc.pid());
    }

    fn yield_now(&mut self, _proc: &mut Process) {
        self.yields += 1;
    }

    fn wakeup_ticks(&mut self, ticks: u32) {
        self.wakeups.push(ticks);
    }

    fn spawn(&mut self, child: Process, tf: TrapFrame) {
        self.spawned.push((child, tf));
    }
}

impl InterruptController for Env {
    fn end_of_interrupt(&mut self, cpu: usize) {
        self.eoi.push(cpu);
    }

    fn device_interrupt(&mut self, irq: Irq) {
        self.devices.push(irq);
    }
}

pub fn boot() -> (Kernel<RamFrames>, Cpu) {
    let kernel = Kernel::boot(RamFrames::new(RAM_FIRST_FRAME, RAM_FRAMES), LAYOUT).unwrap();
    (kernel, Cpu::new(0))
}

/// A running process executing `/init` with `argv = ["init"]`, active on
/// `cpu`, and its initial frame.
pub fn start_init(kernel: &Kernel<RamFrames>, cpu: &mut Cpu, env: &mut Env) -> (Process, TrapFrame) {
    let mut proc = kernel.create_process(cpu, "init").unwrap();
    let mut tf = TrapFrame::user(T_SYSCALL, 0, 0);
    kernel.exec(cpu, &mut tf, &mut proc, env, "/init", &["init"]).unwrap();
    proc.state = ProcState::Running;
    (proc, tf)
}

pub fn free_frames(kernel: &Kernel<RamFrames>, cpu: &Cpu) -> usize {
    kernel.with_memory(cpu, |mem| mem.free_frames())
}

pub fn refcount(kernel: &Kernel<RamFrames>, cpu: &Cpu, frame: PhysicalFrame) -> u32 {
    kernel.with_memory(cpu, |mem| mem.refcount(frame))
}

pub fn frame_of(proc: &Process, va: u32) -> PhysicalFrame {
    proc.space
        .as_ref()
        .unwrap()
        .user_frame(VirtualAddress::new(va))
        .unwrap()
}

pub fn is_mapped(proc: &Process, va: u32) -> bool {
    proc.space
        .as_ref()
        .unwrap()
        .entry(VirtualAddress::new(va))
        .is_some_and(|e| e.present())
}

pub fn read_user(kernel: &Kernel<RamFrames>, cpu: &Cpu, proc: &Process, va: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    kernel
        .with_memory(cpu, |mem| {
            proc.space
                .as_ref()
                .unwrap()
                .copy_in(mem, VirtualAddress::new(va), &mut buf)
        })
        .unwrap();
    buf
}

pub fn read_word(kernel: &Kernel<RamFrames>, cpu: &Cpu, proc: &Process, va: u32) -> u32 {
    let b = read_user(kernel, cpu, proc, va, 4);
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

pub fn write_user(kernel: &Kernel<RamFrames>, cpu: &Cpu, proc: &Process, va: u32, bytes: &[u8]) {
    kernel
        .with_memory(cpu, |mem| {
            proc.space
                .as_ref()
                .unwrap()
                .copy_out(mem, VirtualAddress::new(va), bytes)
        })
        .unwrap();
}

pub fn write_words(kernel: &Kernel<RamFrames>, cpu: &Cpu, proc: &Process, va: u32, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    write_user(kernel, cpu, proc, va, &bytes);
}

/// Take a page fault at `addr` with error code `err` while the user stack
/// pointer is `esp`.
pub fn fault(
    kernel: &Kernel<RamFrames>,
    cpu: &mut Cpu,
    proc: &mut Process,
    env: &mut Env,
    addr: u32,
    err: u32,
    esp: u32,
) -> kernel::TrapOutcome {
    let mut tf = TrapFrame::user(T_PGFLT, ENTRY, esp);
    tf.err = err;
    cpu.latch_fault_address(addr);
    kernel.trap(cpu, &mut tf, Some(proc), env)
}

/// Store `words` at `esp` the way user code would: a page still shared
/// copy-on-write takes its write fault first.
pub fn push_words(kernel: &Kernel<RamFrames>, cpu: &mut Cpu, proc: &mut Process, env: &mut Env, esp: u32, words: &[u32]) {
    let end = esp + 4 * u32::try_from(words.len()).unwrap();
    let mut page = esp & !(PAGE_SIZE - 1);
    while page < end {
        let shared = proc
            .space
            .as_ref()
            .unwrap()
            .entry(VirtualAddress::new(page))
            .is_some_and(|e| e.present() && e.copy_on_write());
        if shared {
            let at = page.max(esp);
            assert_eq!(fault(kernel, cpu, proc, env, at, USER_WRITE_PRESENT, at), kernel::TrapOutcome::Resume);
        }
        page += PAGE_SIZE;
    }
    write_words(kernel, cpu, proc, esp, words);
}

/// Issue system call `num` with the given stack arguments, written just
/// below the current stack pointer of `tf`. Returns `eax`.
pub fn syscall(
    kernel: &Kernel<RamFrames>,
    cpu: &mut Cpu,
    tf: &mut TrapFrame,
    proc: &mut Process,
    env: &mut Env,
    num: u32,
    args: &[u32],
) -> (kernel::TrapOutcome, u32) {
    let mut frame = vec![0xdead_beef_u32]; // return address of the stub
    frame.extend_from_slice(args);
    let esp = tf.esp - 4 * u32::try_from(frame.len()).unwrap() - 64;
    push_words(kernel, cpu, proc, env, esp, &frame);

    let saved_esp = tf.esp;
    tf.trapno = T_SYSCALL;
    tf.eax = num;
    tf.esp = esp;
    let outcome = kernel.trap(cpu, tf, Some(proc), env);
    if tf.esp == esp {
        tf.esp = saved_esp;
    }
    (outcome, tf.eax)
}

/// Present user pages per frame across `procs` must equal the reference
/// table.
pub fn assert_refcounts_match(kernel: &Kernel<RamFrames>, cpu: &Cpu, procs: &[&Process]) {
    let mut counts: BTreeMap<PhysicalFrame, u32> = BTreeMap::new();
    for p in procs {
        if let Some(space) = &p.space {
            for (_, e) in space.user_pages() {
                *counts.entry(e.frame()).or_insert(0) += 1;
            }
        }
    }
    let refs: BTreeMap<PhysicalFrame, u32> = kernel.with_memory(cpu, |mem| mem.refs().referenced().collect());
    assert_eq!(refs, counts);
}

pub fn is_active(cpu: &Cpu, proc: &Process) -> bool {
    proc.space
        .as_ref()
        .is_some_and(|s| cpu.active_root() == Some(s.root()))
}
