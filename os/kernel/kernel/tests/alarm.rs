mod common;

use common::*;
use kernel::trap::{IRQ_TIMER, T_IRQ0, T_SYSCALL};
use kernel::{AlarmError, AlarmPhase, ContinuationRecord, Cpu, Kernel, Process, TrapFrame, TrapOutcome};
use kernel_alloc::frame_alloc::RamFrames;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_syscall::{SYSCALL_FAILED, Sysno};

const T_TIMER: u32 = T_IRQ0 + IRQ_TIMER;

fn armed(period: u32) -> (Kernel<RamFrames>, Cpu, Env, Process, TrapFrame) {
    let (kernel, mut cpu) = boot();
    let mut env = Env::with_programs();
    let (mut proc, mut tf) = start_init(&kernel, &mut cpu, &mut env);
    let (_, ret) = syscall(
        &kernel,
        &mut cpu,
        &mut tf,
        &mut proc,
        &mut env,
        Sysno::Alarm.as_u32(),
        &[period, HANDLER, RESTORE],
    );
    assert_eq!(ret, 0);
    assert_eq!(proc.alarm.phase(), AlarmPhase::Armed);
    (kernel, cpu, env, proc, tf)
}

fn tick(kernel: &Kernel<RamFrames>, cpu: &mut Cpu, tf: &mut TrapFrame, proc: &mut Process, env: &mut Env) -> TrapOutcome {
    tf.trapno = T_TIMER;
    kernel.trap(cpu, tf, Some(proc), env)
}

#[test]
fn delivery_pushes_the_record_and_enters_the_handler() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(2);
    tf.eip = ENTRY + 4;
    tf.eax = 0x1111;
    tf.ecx = 0x2222;
    tf.edx = 0x3333;
    let esp = tf.esp;

    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, ENTRY + 4, "one tick to go");
    assert_eq!(proc.alarm.ticks_left(), 1);

    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    let at = ContinuationRecord::placement(esp).unwrap().as_u32();
    assert_eq!(tf.eip, HANDLER);
    assert_eq!(tf.esp, at);
    assert_eq!(tf.eax, 0x1111, "the handler sees the interrupted registers");
    assert_eq!(proc.alarm.phase(), AlarmPhase::InHandler);
    assert_eq!(proc.alarm.record(), Some(VirtualAddress::new(at + 12)));

    let words: Vec<u32> = (0..8).map(|i| read_word(&kernel, &cpu, &proc, at + 4 * i)).collect();
    assert_eq!(
        words,
        [RESTORE, 0xffff_ffff, at + 12, ENTRY + 4, 0x1111, 0x2222, 0x3333, esp]
    );
    assert_eq!(env.yields, 2);
}

#[test]
fn expiry_inside_the_handler_is_not_redelivered() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, HANDLER);
    let record = proc.alarm.record();
    let handler_esp = tf.esp;

    tf.eip = HANDLER + 0x20;
    for _ in 0..4 {
        tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    }
    assert_eq!(tf.eip, HANDLER + 0x20);
    assert_eq!(tf.esp, handler_esp);
    assert_eq!(proc.alarm.record(), record);
}

#[test]
fn alarm_return_restores_the_interrupted_context() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tf.eip = ENTRY + 8;
    tf.eax = 0xaaaa;
    tf.ecx = 0xbbbb;
    tf.edx = 0xcccc;
    let esp = tf.esp;
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    let at = tf.esp;

    // The handler clobbers registers, then `ret` pops the restore routine,
    // which traps with the record pointer above its fake return slot.
    tf.eax = 0;
    tf.ecx = 0;
    tf.edx = 0;
    tf.esp = at + 4;
    tf.eip = RESTORE + 7;
    tf.eax = Sysno::AlarmReturn.as_u32();
    tf.trapno = T_SYSCALL;
    let outcome = kernel.trap(&mut cpu, &mut tf, Some(&mut proc), &mut env);

    assert_eq!(outcome, TrapOutcome::Resume);
    assert_eq!((tf.eip, tf.esp), (ENTRY + 8, esp));
    assert_eq!((tf.eax, tf.ecx, tf.edx), (0xaaaa, 0xbbbb, 0xcccc));
    assert_eq!(proc.alarm.phase(), AlarmPhase::Armed);

    // Armed again: the next expiry delivers.
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, HANDLER);
}

#[test]
fn alarm_return_with_the_wrong_record_fails() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    let at = tf.esp;

    // esp + 4 now holds the fake return address instead of the record.
    tf.esp = at;
    tf.eax = Sysno::AlarmReturn.as_u32();
    tf.trapno = T_SYSCALL;
    kernel.trap(&mut cpu, &mut tf, Some(&mut proc), &mut env);
    assert_eq!(tf.eax, SYSCALL_FAILED);
    assert_eq!(proc.alarm.phase(), AlarmPhase::InHandler);
}

#[test]
fn alarm_return_outside_a_handler_fails() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(10);
    let (_, ret) = syscall(&kernel, &mut cpu, &mut tf, &mut proc, &mut env, Sysno::AlarmReturn.as_u32(), &[0]);
    assert_eq!(ret, SYSCALL_FAILED);
    assert!(matches!(
        kernel.restore_from_handler(&cpu, &mut tf, &mut proc),
        Err(AlarmError::NotInHandler)
    ));
}

#[test]
fn record_below_the_stack_grows_the_stack() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tf.esp = STACK_START + 8;
    let before = free_frames(&kernel, &cpu);

    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    let at = STACK_START + 8 - ContinuationRecord::SIZE;
    assert_eq!(tf.esp, at);
    assert_eq!(proc.stack.start.as_u32(), GUARD);
    assert_eq!(proc.stack.size, 2 * PAGE_SIZE);
    assert_eq!(free_frames(&kernel, &cpu), before - 1);
    assert_eq!(read_word(&kernel, &cpu, &proc, at), RESTORE);
    assert_eq!(read_word(&kernel, &cpu, &proc, at + 28), STACK_START + 8);
}

#[test]
fn record_two_pages_below_the_stack_grows_it_from_the_top() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tf.esp = GUARD + 0x10;
    let before = free_frames(&kernel, &cpu);

    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, HANDLER);
    assert_eq!(tf.esp, GUARD + 0x10 - ContinuationRecord::SIZE);
    assert_eq!(proc.stack.start.as_u32(), GUARD - PAGE_SIZE);
    assert_eq!(proc.stack.size, 3 * PAGE_SIZE);
    assert_eq!(free_frames(&kernel, &cpu), before - 2);
    assert_eq!(read_word(&kernel, &cpu, &proc, tf.esp), RESTORE);
    assert_eq!(read_word(&kernel, &cpu, &proc, tf.esp + 28), GUARD + 0x10);
}

#[test]
fn record_that_cannot_grow_the_stack_kills_without_leaking() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tf.esp = STACK_START + 8;
    let before = free_frames(&kernel, &cpu);

    let held = kernel.with_memory(&cpu, |mem| mem.allocator_mut().reserve_all_but(0));
    let outcome = tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(outcome, TrapOutcome::Exited);
    assert!(proc.killed);
    assert_eq!(proc.alarm.phase(), AlarmPhase::Disarmed);
    assert_eq!(env.exited, [proc.pid()]);

    kernel.with_memory(&cpu, |mem| mem.allocator_mut().release(held));
    assert_eq!(free_frames(&kernel, &cpu), before + IMAGE_FRAMES);
}

#[test]
fn record_on_a_shared_stack_page_is_copied_first() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    kernel.fork(&mut cpu, &tf, &mut proc, &mut env).unwrap();
    let (child, _) = env.spawned.pop().unwrap();
    let shared = frame_of(&child, STACK_START);

    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, HANDLER);
    assert_ne!(frame_of(&proc, STACK_START), shared);
    assert_eq!(read_word(&kernel, &cpu, &proc, tf.esp), RESTORE);
    assert_refcounts_match(&kernel, &cpu, &[&proc, &child]);
}

#[test]
fn undeliverable_alarm_kills() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tf.esp = 0x0002_0000;

    let outcome = tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(outcome, TrapOutcome::Exited);
    assert!(proc.killed);
    assert_eq!(proc.alarm.phase(), AlarmPhase::Disarmed);
    assert_eq!(env.exited, [proc.pid()]);
}

#[test]
fn kernel_mode_ticks_do_not_count() {
    let (kernel, mut cpu, mut env, mut proc, _) = armed(1);
    let mut tf = TrapFrame::kernel(T_TIMER, 0x4010_0000);

    kernel.trap(&mut cpu, &mut tf, Some(&mut proc), &mut env);
    assert_eq!(tf.eip, 0x4010_0000);
    assert_eq!(proc.alarm.ticks_left(), 1);
    assert_eq!(proc.alarm.phase(), AlarmPhase::Armed);
}

#[test]
fn entries_must_be_user_addresses() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(3);
    let kernel_text = LAYOUT.kernel_base + 0x1000;

    let err = kernel
        .arm_alarm(&mut proc, 5, VirtualAddress::new(kernel_text), VirtualAddress::new(RESTORE))
        .unwrap_err();
    assert_eq!(err, AlarmError::BadEntry(VirtualAddress::new(kernel_text)));
    assert_eq!(proc.alarm.period(), 3, "rejected arming leaves the alarm as it was");

    let (_, ret) = syscall(
        &kernel,
        &mut cpu,
        &mut tf,
        &mut proc,
        &mut env,
        Sysno::Alarm.as_u32(),
        &[5, HANDLER, kernel_text],
    );
    assert_eq!(ret, SYSCALL_FAILED);

    let (_, ret) = syscall(&kernel, &mut cpu, &mut tf, &mut proc, &mut env, Sysno::Alarm.as_u32(), &[u32::MAX, HANDLER, RESTORE]);
    assert_eq!(ret, SYSCALL_FAILED, "negative period");
}

#[test]
fn period_zero_disarms() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    let (_, ret) = syscall(&kernel, &mut cpu, &mut tf, &mut proc, &mut env, Sysno::Alarm.as_u32(), &[0, 0, 0]);
    assert_eq!(ret, 0);
    assert_eq!(proc.alarm.phase(), AlarmPhase::Disarmed);

    let eip = tf.eip;
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(tf.eip, eip);
}

#[test]
fn exec_forgets_the_alarm() {
    let (kernel, mut cpu, mut env, mut proc, mut tf) = armed(1);
    tick(&kernel, &mut cpu, &mut tf, &mut proc, &mut env);
    assert_eq!(proc.alarm.phase(), AlarmPhase::InHandler);

    kernel
        .exec(&mut cpu, &mut tf, &mut proc, &mut env, "/bin/echo", &["echo"])
        .unwrap();
    assert_eq!(proc.alarm.phase(), AlarmPhase::Disarmed);
}
