//! Session facade and step controller against a fake DZRP remote: handshake,
//! breakpoint lifecycle, transparent stops and reverse replay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use z80probe::error::Error;
use z80probe::oracle::ConditionEvaluator;
use z80probe::protocol::codec::FrameDecoder;
use z80probe::protocol::{BreakCode, Command, RemoteFamily, StopNotification};
use z80probe::registers::{RegisterSnapshot, Z80Registers};
use z80probe::session::breakpoint::{AccessMode, GenericBreakpoint, Watchpoint};
use z80probe::session::step::StopReason;
use z80probe::session::{RemoteSession, SessionBuilder};
use z80probe::LongAddress;

/// Machine state behind the fake remote. Tests mutate it between calls to
/// stage register values, memory contents and scripted stop notifications.
struct Machine {
    regs: Z80Registers,
    mem: Vec<u8>,
    family: RemoteFamily,
    next_bp_id: u16,
    reject_breakpoints: bool,
    /// Notification sent after each Continue acknowledgement.
    stops: VecDeque<StopNotification>,
    /// Register state the machine assumes on each Continue, front first.
    continue_regs: VecDeque<Z80Registers>,
    /// Injects a stop notification while no Continue is being handled.
    stop_injector: Option<mpsc::UnboundedSender<StopNotification>>,
    continues_seen: usize,
    removals_seen: usize,
}

impl Machine {
    fn new() -> Arc<Mutex<Machine>> {
        Arc::new(Mutex::new(Machine {
            regs: Z80Registers::default(),
            mem: vec![0u8; 0x1_0000],
            family: RemoteFamily::Zx48,
            next_bp_id: 1,
            reject_breakpoints: false,
            stops: VecDeque::new(),
            continue_regs: VecDeque::new(),
            stop_injector: None,
            continues_seen: 0,
            removals_seen: 0,
        }))
    }
}

fn stop(reason: BreakCode, address: u16) -> StopNotification {
    StopNotification {
        reason,
        address,
        text: String::new(),
    }
}

async fn send_frame(io: &mut DuplexStream, seq: u8, payload: &[u8]) {
    let mut wire = Vec::with_capacity(5 + payload.len());
    wire.extend_from_slice(&((1 + payload.len()) as u32).to_le_bytes());
    wire.push(seq);
    wire.extend_from_slice(payload);
    io.write_all(&wire).await.unwrap();
}

fn spawn_remote(mut io: DuplexStream, machine: Arc<Mutex<Machine>>) {
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel();
    machine.lock().unwrap().stop_injector = Some(inject_tx);
    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::select! {
                read = io.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                },
                Some(notification) = inject_rx.recv() => {
                    send_frame(&mut io, 0, &notification.encode()).await;
                    continue;
                }
            };
            let mut frames = vec![];
            decoder.feed(&buf[..n], &mut frames).unwrap();

            for frame in frames {
                let command = Command::from_repr(frame.payload[0]).unwrap();
                let req = &frame.payload[1..];

                // build the response under the lock, transmit outside it
                let (response, notification) = {
                    let mut m = machine.lock().unwrap();
                    match command {
                        Command::Init => {
                            let mut r = vec![0, 2, 0, 0, m.family as u8];
                            r.extend_from_slice(b"test.sna");
                            (r, None)
                        }
                        Command::GetRegisters => {
                            (RegisterSnapshot::Standard(m.regs).encode(), None)
                        }
                        Command::ReadMem => {
                            let addr = u16::from_le_bytes([req[1], req[2]]) as usize;
                            let len = u16::from_le_bytes([req[3], req[4]]) as usize;
                            (m.mem[addr..addr + len].to_vec(), None)
                        }
                        Command::WriteMem => {
                            let addr = u16::from_le_bytes([req[1], req[2]]) as usize;
                            let data = &req[3..];
                            m.mem[addr..addr + data.len()].copy_from_slice(data);
                            (vec![], None)
                        }
                        Command::AddBreakpoint => {
                            let id = if m.reject_breakpoints {
                                0
                            } else {
                                let id = m.next_bp_id;
                                m.next_bp_id += 1;
                                id
                            };
                            (id.to_le_bytes().to_vec(), None)
                        }
                        Command::RemoveBreakpoint => {
                            m.removals_seen += 1;
                            (vec![], None)
                        }
                        Command::AddWatchpoint => (vec![0], None),
                        Command::RemoveWatchpoint => (vec![], None),
                        Command::Continue => {
                            m.continues_seen += 1;
                            if let Some(regs) = m.continue_regs.pop_front() {
                                m.regs = regs;
                            }
                            (vec![], m.stops.pop_front())
                        }
                        Command::Loopback => (req.to_vec(), None),
                        _ => (vec![], None),
                    }
                };

                send_frame(&mut io, frame.seq, &response).await;
                if let Some(n) = notification {
                    send_frame(&mut io, 0, &n.encode()).await;
                }
            }
        }
    });
}

async fn connect(machine: Arc<Mutex<Machine>>) -> RemoteSession {
    let _ = env_logger::builder().is_test(true).try_init();
    let (near, far) = tokio::io::duplex(8192);
    spawn_remote(far, machine);
    SessionBuilder::new().connect(near).await.unwrap()
}

async fn connect_with(builder: SessionBuilder, machine: Arc<Mutex<Machine>>) -> RemoteSession {
    let (near, far) = tokio::io::duplex(8192);
    spawn_remote(far, machine);
    builder.connect(near).await.unwrap()
}

#[tokio::test]
async fn init_handshake_and_capability_gating() {
    let machine = Machine::new();
    let session = connect(machine).await;

    assert_eq!(session.info().program, "test.sna");
    assert_eq!(session.info().family, RemoteFamily::Zx48);
    assert_eq!(session.info().version, (2, 0, 0));

    // a ZX 48 remote has no sprite hardware: fail fast, nothing transmitted
    let err = session.get_sprites(0, 1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedCommand(Command::GetSprites)
    ));

    session.loopback(b"ping").await.unwrap();
}

#[tokio::test]
async fn breakpoint_lifecycle_with_rejection() {
    let machine = Machine::new();
    let mut session = connect(machine.clone()).await;

    let first = LongAddress::plain(0x4000);
    let id = session
        .add_breakpoint(GenericBreakpoint::manual(first))
        .await
        .unwrap();
    assert_eq!(id, 1);
    assert!(session.breakpoints().at(first)[0].is_verified());

    // remote out of capacity: breakpoint is kept, unverified, not an error
    machine.lock().unwrap().reject_breakpoints = true;
    let rejected = LongAddress::plain(0x5000);
    let id = session
        .add_breakpoint(GenericBreakpoint::manual(rejected))
        .await
        .unwrap();
    assert_eq!(id, 0);
    assert_eq!(session.breakpoints().len(), 2);
    assert!(!session.breakpoints().at(rejected)[0].is_verified());

    session.remove_breakpoint(first, 1).await.unwrap();
    assert_eq!(session.breakpoints().len(), 1);
    // the unverified one was never registered remotely
    session.remove_breakpoint(rejected, 0).await.unwrap();
    assert_eq!(session.breakpoints().len(), 0);
    assert_eq!(machine.lock().unwrap().removals_seen, 1);
}

/// A watch stop for an address without a registered watchpoint (stale or
/// wrong bank) resumes implicitly, it is not a visible stop.
#[tokio::test]
async fn stale_watchpoint_stop_resumes() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.stops.push_back(stop(BreakCode::WatchWrite, 0xC000));
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x4000));
    }
    let mut session = connect(machine.clone()).await;
    session
        .add_breakpoint(GenericBreakpoint::manual(LongAddress::plain(0x4000)))
        .await
        .unwrap();

    let outcome = session.resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(0x4000));
    assert_eq!(machine.lock().unwrap().continues_seen, 2);
}

#[tokio::test]
async fn registered_watchpoint_stop_is_visible() {
    let machine = Machine::new();
    machine
        .lock()
        .unwrap()
        .stops
        .push_back(stop(BreakCode::WatchWrite, 0xC002));
    let mut session = connect(machine.clone()).await;
    session
        .add_watchpoint(Watchpoint {
            address: 0xC000,
            size: 4,
            access: AccessMode::Write,
            condition: None,
        })
        .await
        .unwrap();

    let outcome = session.resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::WatchpointWrite(0xC002));
    assert_eq!(machine.lock().unwrap().continues_seen, 1);
}

#[tokio::test]
async fn logpoint_stop_is_transparent() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x5000));
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x4000));
    }
    let mut session = connect(machine.clone()).await;
    session
        .add_breakpoint(GenericBreakpoint::logpoint(
            LongAddress::plain(0x5000),
            "reached the loader",
        ))
        .await
        .unwrap();
    session
        .add_breakpoint(GenericBreakpoint::manual(LongAddress::plain(0x4000)))
        .await
        .unwrap();

    let outcome = session.resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(0x4000));
    assert_eq!(machine.lock().unwrap().continues_seen, 2);
}

struct LiteralEvaluator;

impl ConditionEvaluator for LiteralEvaluator {
    fn evaluate(&self, condition: &str, _regs: &Z80Registers) -> anyhow::Result<bool> {
        Ok(condition == "true")
    }
}

#[tokio::test]
async fn false_condition_resumes() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x4000));
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x5000));
    }
    let mut session = connect_with(
        SessionBuilder::new().with_evaluator(LiteralEvaluator),
        machine.clone(),
    )
    .await;
    session
        .add_breakpoint(
            GenericBreakpoint::manual(LongAddress::plain(0x4000)).with_condition("false"),
        )
        .await
        .unwrap();
    session
        .add_breakpoint(GenericBreakpoint::manual(LongAddress::plain(0x5000)))
        .await
        .unwrap();

    // the stop at 0x4000 is invisible: its only breakpoint's condition is
    // false, so the continuation is re-issued
    let outcome = session.resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(0x5000));
    assert_eq!(machine.lock().unwrap().continues_seen, 2);
}

#[tokio::test]
async fn step_over_lands_on_successor() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.regs.pc = 0x6000;
        m.mem[0x6000] = 0x00; // NOP
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x6001));
    }
    let mut session = connect(machine.clone()).await;

    let outcome = session.step_over().await.unwrap();
    // landing on the internal temporary breakpoint is a step completion,
    // never reported as a breakpoint hit
    assert_eq!(outcome.reason, StopReason::StepDone);
    assert_eq!(outcome.pc, 0x6001);
}

/// Stepping into a return lands at the address stored at (SP); the
/// fall-through successor is unreachable after a taken return.
#[tokio::test]
async fn step_into_a_return_lands_at_the_return_address() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.regs.pc = 0x8005;
        m.regs.sp = 0x7FFE;
        m.mem[0x8005] = 0xC9; // RET
        m.mem[0x7FFE] = 0x03;
        m.mem[0x7FFF] = 0x70; // return address 0x7003
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x7003));
    }
    let mut session = connect(machine.clone()).await;

    let outcome = session.step_into().await.unwrap();
    assert_eq!(outcome.reason, StopReason::StepDone);
    assert_eq!(outcome.pc, 0x7003);
}

#[tokio::test]
async fn step_out_returns_to_the_caller() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        // inside a subroutine: NOP at 0x8000, RET at 0x8001, the caller
        // resumes at 0x7003
        m.regs.pc = 0x8000;
        m.regs.sp = 0x7FFE;
        m.mem[0x8000] = 0x00;
        m.mem[0x8001] = 0xC9;
        m.mem[0x7FFE] = 0x03;
        m.mem[0x7FFF] = 0x70;

        let mut after_nop = m.regs;
        after_nop.pc = 0x8001;
        let mut after_ret = m.regs;
        after_ret.pc = 0x7003;
        after_ret.sp = 0x8000;
        m.continue_regs.push_back(after_nop);
        m.continue_regs.push_back(after_ret);
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x8001));
        m.stops.push_back(stop(BreakCode::Breakpoint, 0x7003));
    }
    let mut session = connect(machine.clone()).await;

    let outcome = session.step_out().await.unwrap();
    assert_eq!(outcome.reason, StopReason::StepDone);
    assert_eq!(outcome.pc, 0x7003);
    assert_eq!(machine.lock().unwrap().continues_seen, 2);
}

/// Breakpoints can be added while a continuation is outstanding: the control
/// handle patches the live stop-evaluation index, so a logpoint registered
/// mid-run is already transparent at its first hit.
#[tokio::test]
async fn breakpoint_added_mid_run_is_honored() {
    let machine = Machine::new();
    let mut session = connect(machine.clone()).await;
    let control = session.control();
    let inject = machine.lock().unwrap().stop_injector.clone().unwrap();

    let run = tokio::spawn(async move {
        let outcome = session.resume().await;
        (session, outcome)
    });
    while machine.lock().unwrap().continues_seen == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // the program is running; register a logpoint through the handle
    control
        .add_breakpoint(GenericBreakpoint::logpoint(
            LongAddress::plain(0x5000),
            "loader reached",
        ))
        .await
        .unwrap();

    // its stop is transparent: the continuation is re-issued
    inject.send(stop(BreakCode::Breakpoint, 0x5000)).unwrap();
    while machine.lock().unwrap().continues_seen < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    inject.send(stop(BreakCode::Manual, 0x5003)).unwrap();
    let (session, outcome) = run.await.unwrap();
    assert_eq!(outcome.unwrap().reason, StopReason::ManualPause);
    assert_eq!(session.breakpoints().len(), 1);
}

/// A step back that fails at the history edge must not leave a stale call
/// stack seed behind; the next attempt reseeds from the then-current state.
#[tokio::test]
async fn failed_step_back_leaves_no_stale_seed() {
    let machine = Machine::new();
    let mut session = connect(machine.clone()).await;

    // nothing recorded yet
    assert!(matches!(
        session.step_back().await,
        Err(Error::HistoryExhausted)
    ));
    assert!(session.replay_call_stack().is_none());

    {
        let mut m = machine.lock().unwrap();
        m.regs.pc = 0x3000;
        m.regs.sp = 0x8000;
        m.mem[0x3000] = 0x00; // NOP
    }
    session.record_history_entry().await.unwrap();
    machine.lock().unwrap().regs.pc = 0x3001;

    let outcome = session.step_back().await.unwrap();
    assert_eq!(outcome.pc, 0x3000);
    let stack = session.replay_call_stack().unwrap();
    assert_eq!(stack.top().unwrap().pc, 0x3000);
}

#[tokio::test]
async fn reverse_replay_rebuilds_and_unwinds_frames() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        // CALL 0x8000 at 0x7000, RET at 0x8005
        m.mem[0x7000] = 0xCD;
        m.mem[0x7001] = 0x00;
        m.mem[0x7002] = 0x80;
        m.mem[0x8005] = 0xC9;
        m.regs.pc = 0x7000;
        m.regs.sp = 0x8000;
    }
    let mut session = connect(machine.clone()).await;

    session.record_history_entry().await.unwrap();
    {
        let mut m = machine.lock().unwrap();
        // inside the subroutine, about to return
        m.regs.pc = 0x8005;
        m.regs.sp = 0x7FFE;
        m.mem[0x7FFE] = 0x03; // return address 0x7003
        m.mem[0x7FFF] = 0x70;
    }
    session.record_history_entry().await.unwrap();
    {
        let mut m = machine.lock().unwrap();
        // live: back in the caller
        m.regs.pc = 0x7003;
        m.regs.sp = 0x8000;
    }
    assert_eq!(session.history().len(), 2);

    // step back over the RET: the subroutine frame reappears
    let outcome = session.step_back().await.unwrap();
    assert_eq!(outcome.reason, StopReason::StepDone);
    assert_eq!(outcome.pc, 0x8005);
    let stack = session.replay_call_stack().unwrap();
    assert_eq!(stack.depth(), 2);
    assert_eq!(stack.top().unwrap().entry, 0x8000);
    assert_eq!(stack.top().unwrap().name, "0x8000");

    // step back over the CALL: back to the root frame
    let outcome = session.step_back().await.unwrap();
    assert_eq!(outcome.pc, 0x7000);
    let stack = session.replay_call_stack().unwrap();
    assert_eq!(stack.depth(), 1);
    assert_eq!(stack.top().unwrap().pc, 0x7000);

    // at the window edge, further steps back report history exhaustion
    assert!(matches!(
        session.step_back().await,
        Err(Error::HistoryExhausted)
    ));

    // replay forward to the live position
    let outcome = session.resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::StepDone);
    assert_eq!(outcome.pc, 0x7003);
    assert!(!session.history().is_replaying());
    assert!(session.replay_call_stack().is_none());
}

#[tokio::test]
async fn reverse_resume_stops_at_breakpoint_in_history() {
    let machine = Machine::new();
    {
        let mut m = machine.lock().unwrap();
        m.regs.pc = 0x2000;
        m.regs.sp = 0x8000;
        m.mem[0x2000] = 0x00;
    }
    let mut session = connect(machine.clone()).await;

    for pc in [0x2000u16, 0x2001, 0x2002] {
        machine.lock().unwrap().regs.pc = pc;
        session.record_history_entry().await.unwrap();
    }
    machine.lock().unwrap().regs.pc = 0x2003;

    session
        .add_breakpoint(GenericBreakpoint::manual(LongAddress::plain(0x2001)))
        .await
        .unwrap();

    let outcome = session.reverse_resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::BreakpointHit(0x2001));
    assert!(session.history().is_replaying());

    // with no breakpoint in range, reverse-continue runs out of history
    session.return_to_live();
    session
        .remove_breakpoint(LongAddress::plain(0x2001), 1)
        .await
        .unwrap();
    let outcome = session.reverse_resume().await.unwrap();
    assert_eq!(outcome.reason, StopReason::HistoryEdge);
}
