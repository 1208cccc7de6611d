//! i8253/8254 interval-timer model.
//!
//! Three channels with the full register state machine: counter modes
//! 0..5, LSB/MSB/word read-write sequencing, counter and status
//! latching, the read-back command, and the channel-2 GATE via port
//! 0x61 (speaker bits are ignored). Channel 0 drives `IRQ_TIMER` at
//! level 2.
//!
//! Counts are converted between guest TSC ticks and PIT cycles with
//! [`muldiv64`]; every time-dependent entry point takes the current
//! guest TSC so the model is deterministic. The interrupt trigger is
//! asynchronous to the counter: an interrupt fires on the first update
//! after its period boundary, guarded by `last_intr_time` monotonicity,
//! so operating systems that count timer interrupts keep correct time.
//!
//! BCD counting is not supported and faults the device.

use super::IrqAssert;
use crate::config::{IRQ_TIMER, PIT_FREQ};
use crate::sync::SpinLock;

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

/// Interrupt on terminal count.
const MODE_0: u8 = 0;
/// Hardware retriggerable one-shot.
const MODE_1: u8 = 1;
/// Rate generator.
const MODE_2: u8 = 2;
/// Square wave.
const MODE_3: u8 = 3;
/// Software triggered strobe.
const MODE_4: u8 = 4;
/// Hardware triggered strobe.
const MODE_5: u8 = 5;

const RW_STATE_LSB: u8 = 1;
const RW_STATE_MSB: u8 = 2;
const RW_STATE_WORD0: u8 = 3;
const RW_STATE_WORD1: u8 = 4;

const CHANNEL0_PORT: u16 = 0x40;
const CHANNEL1_PORT: u16 = 0x41;
const CHANNEL2_PORT: u16 = 0x42;
const CONTROL_PORT: u16 = 0x43;
const GATE_PORT: u16 = 0x61;

/// Level reported with `IRQ_TIMER` assertions.
const IRQ_TIMER_LEVEL: u8 = 2;

/// `a * b / c` without overflow, via a 32x32->64 split of `a`.
pub fn muldiv64(a: u64, b: u32, c: u32) -> u64 {
    let a_lo = a as u32 as u64;
    let a_hi = a >> 32;
    let rl = a_lo * b as u64;
    let rh = a_hi * b as u64 + (rl >> 32);
    let res_hi = rh / c as u64;
    let res_lo = (((rh % c as u64) << 32) + (rl & 0xffff_ffff)) / c as u64;
    (res_hi << 32) | res_lo
}

/// One channel's register state.
#[derive(Debug, Clone, Copy)]
struct PitChannel {
    mode: u8,
    /// Loaded count; 1..=0x10000 (a written 0 means 0x10000).
    count: u32,
    /// Guest TSC at the last count load.
    count_load_time: u64,
    rw_mode: u8,
    read_state: u8,
    write_state: u8,
    write_latch: u8,
    /// Non-zero: the rw state the latched count is read back with.
    count_latched: u8,
    latched_count: u32,
    status_latched: bool,
    status: u8,
    bcd: bool,
    gate: u8,
    enabled: bool,
    last_intr_time_valid: bool,
    last_intr_time: u64,
}

impl PitChannel {
    const fn reset() -> Self {
        Self {
            mode: MODE_0,
            count: 0x10000,
            count_load_time: 0,
            rw_mode: RW_STATE_LSB,
            read_state: RW_STATE_LSB,
            write_state: RW_STATE_LSB,
            write_latch: 0,
            count_latched: 0,
            latched_count: 0,
            status_latched: false,
            status: 0,
            bcd: false,
            gate: 0,
            enabled: false,
            last_intr_time_valid: false,
            last_intr_time: 0,
        }
    }
}

/// The virtual i8253/8254.
pub struct Pit {
    channels: [SpinLock<PitChannel>; 3],
    guest_tsc_freq: u64,
    irq_events: spin::Mutex<Vec<IrqAssert>>,
}

impl Pit {
    /// A PIT for a guest whose TSC runs at `guest_tsc_freq` Hz.
    pub fn new(guest_tsc_freq: u64) -> Self {
        // Channel 2's gate is wired to port 0x61 and starts high on PCs.
        let mut ch2 = PitChannel::reset();
        ch2.gate = 1;
        Self {
            channels: [
                SpinLock::new("vpit0", PitChannel::reset()),
                SpinLock::new("vpit1", PitChannel::reset()),
                SpinLock::new("vpit2", ch2),
            ],
            guest_tsc_freq,
            irq_events: spin::Mutex::new(Vec::new()),
        }
    }

    fn freq(&self) -> u32 {
        self.guest_tsc_freq as u32
    }

    /// Elapsed PIT cycles since the channel's count was loaded.
    fn elapsed(&self, ch: &PitChannel, now: u64) -> u64 {
        muldiv64(now.saturating_sub(ch.count_load_time), PIT_FREQ, self.freq())
    }

    /// Remaining count before OUT changes, per mode.
    fn get_count(&self, ch: &PitChannel, now: u64) -> u32 {
        let d = self.elapsed(ch, now);
        let count = ch.count as u64;
        match ch.mode {
            // Modes 0, 1, 4 and 5 do not repeat.
            MODE_0 | MODE_1 | MODE_4 | MODE_5 => {
                if count > d {
                    ((count - d) & 0xffff) as u32
                } else {
                    0
                }
            }
            MODE_3 => {
                // High for N/2, low for N/2 when N is even; high for
                // (N+1)/2, low for (N-1)/2 when N is odd.
                if count % 2 == 0 {
                    (count - (2 * d) % count) as u32
                } else {
                    let d0 = d % count;
                    let d1 = (count + 1) / 2;
                    if d0 < d1 {
                        (d1 - d0) as u32
                    } else {
                        (d0 - d1) as u32
                    }
                }
            }
            MODE_2 => (count - d % count) as u32,
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        }
    }

    /// The OUT pin at `now`, per mode.
    fn get_out(&self, ch: &PitChannel, now: u64) -> bool {
        let d = self.elapsed(ch, now);
        let count = ch.count as u64;
        match ch.mode {
            MODE_0 => d >= count,
            MODE_1 => d < count,
            MODE_2 => d % count == 0 && d != 0,
            MODE_3 => d % count < (count + 1) >> 1,
            MODE_4 | MODE_5 => d == count,
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        }
    }

    /// Guest TSC of the next channel-0 interrupt.
    fn next_intr_time(&self, ch0: &PitChannel) -> u64 {
        let count = ch0.count as u64;
        match ch0.mode {
            MODE_0 | MODE_1 | MODE_2 | MODE_3 => {
                ch0.count_load_time + muldiv64(count, self.freq(), PIT_FREQ)
            }
            MODE_4 | MODE_5 => ch0.count_load_time + muldiv64(count + 1, self.freq(), PIT_FREQ),
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        }
    }

    /// Guest TSC of the next OUT transition, or `None` when OUT will
    /// never change again (expired one-shot modes).
    fn next_transition_time(&self, ch: &PitChannel, now: u64) -> Option<u64> {
        let d = self.elapsed(ch, now);
        let count = ch.count as u64;
        let next = match ch.mode {
            MODE_0 | MODE_1 => {
                if d < count {
                    count
                } else {
                    return None;
                }
            }
            MODE_2 => {
                let base = (d / count) * count;
                if d - base == 0 && d != 0 {
                    base + count
                } else {
                    base + count + 1
                }
            }
            MODE_3 => {
                let base = (d / count) * count;
                let period2 = (count + 1) >> 1;
                if d - base < period2 {
                    base + period2
                } else {
                    base + count
                }
            }
            MODE_4 | MODE_5 => {
                if d < count {
                    count
                } else if d == count {
                    count + 1
                } else {
                    return None;
                }
            }
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        };
        let mut next = ch.count_load_time + muldiv64(next, self.freq(), PIT_FREQ);
        // Rounding may land on or before `now`; nudge forward.
        if next <= now {
            next = now + 1;
        }
        Some(next)
    }

    /// Fire channel-0 interrupts that came due and re-arm or disable the
    /// channel per its mode.
    fn channel_update(&self, ch: &mut PitChannel, is_channel0: bool, now: u64) {
        if ch.enabled && is_channel0 {
            let intr_time = self.next_intr_time(ch);
            if intr_time <= now && (!ch.last_intr_time_valid || ch.last_intr_time < intr_time) {
                ch.last_intr_time_valid = true;
                ch.last_intr_time = intr_time;
                self.irq_events.lock().push(IrqAssert {
                    irq: IRQ_TIMER,
                    level: IRQ_TIMER_LEVEL,
                });
            }
        }

        let count = ch.count as u64;
        match ch.mode {
            MODE_0 | MODE_1 => {
                let expired = ch.count_load_time + muldiv64(count, self.freq(), PIT_FREQ);
                ch.enabled = now < expired;
            }
            MODE_2 | MODE_3 => {
                let expired = ch.count_load_time + muldiv64(count, self.freq(), PIT_FREQ);
                if now >= expired {
                    // Advance the load time by whole periods so the next
                    // boundary is in the future.
                    let cycle = muldiv64(count, self.freq(), PIT_FREQ);
                    let periods = (now - expired) / cycle;
                    ch.count_load_time +=
                        muldiv64(count * (periods + 1), self.freq(), PIT_FREQ);
                }
                ch.enabled = true;
            }
            MODE_4 | MODE_5 => {
                let expired = ch.count_load_time + muldiv64(count + 1, self.freq(), PIT_FREQ);
                ch.enabled = now < expired;
            }
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        }
    }

    fn load_count(&self, ch: &mut PitChannel, idx: usize, val: u16, now: u64) {
        let count = if val == 0 { 0x10000 } else { val as u32 };
        ch.count_load_time = now;
        ch.count = count;
        self.channel_update(ch, idx == 0, now);
    }

    fn latch_count(&self, ch: &mut PitChannel, now: u64) {
        if ch.count_latched == 0 {
            ch.latched_count = self.get_count(ch, now);
            ch.count_latched = ch.rw_mode;
        }
    }

    fn set_gate(&self, ch: &mut PitChannel, val: u8, now: u64) {
        match ch.mode {
            MODE_0 | MODE_4 => {}
            MODE_1 | MODE_5 | MODE_2 | MODE_3 => {
                if ch.gate < val {
                    // Rising edge restarts counting.
                    ch.count_load_time = now;
                    self.channel_update(ch, false, now);
                }
            }
            mode => panic!("invalid PIT channel mode {mode:#x}"),
        }
        ch.gate = val;
    }

    /// Guest write of `data` to `port` at guest TSC `now`.
    pub fn ioport_write(&self, port: u16, data: u8, now: u64) -> Result<(), super::VdevError> {
        match port {
            CONTROL_PORT => {
                // Control word: SC1 SC0 RW1 RW0 M2 M1 M0 BCD.
                if data & 0x1 != 0 {
                    panic!("PIT BCD counting not supported");
                }
                let channel = (data >> 6) & 0x3;
                if channel == 3 {
                    // Read-back: D3..D1 select channels, D5 latches
                    // count, D4 latches status.
                    for i in 0..3usize {
                        if data & (2 << i) == 0 {
                            continue;
                        }
                        let mut ch = self.channels[i].lock();
                        if data & 0x20 == 0 {
                            self.latch_count(&mut ch, now);
                        }
                        if data & 0x10 == 0 && !ch.status_latched {
                            let out = self.get_out(&ch, now);
                            ch.status = ((out as u8) << 7)
                                | (ch.rw_mode << 4)
                                | (ch.mode << 1)
                                | ch.bcd as u8;
                            ch.status_latched = true;
                        }
                    }
                } else {
                    let mut ch = self.channels[channel as usize].lock();
                    let rw = (data >> 4) & 3;
                    if rw == 0 {
                        self.latch_count(&mut ch, now);
                    } else {
                        ch.rw_mode = rw;
                        ch.read_state = rw;
                        ch.write_state = rw;
                        ch.mode = (data >> 1) & 7;
                        ch.bcd = data & 0x1 != 0;
                    }
                }
                Ok(())
            }
            CHANNEL0_PORT | CHANNEL1_PORT | CHANNEL2_PORT => {
                let idx = (port - CHANNEL0_PORT) as usize;
                let mut ch = self.channels[idx].lock();
                match ch.write_state {
                    RW_STATE_LSB => self.load_count(&mut ch, idx, data as u16, now),
                    RW_STATE_MSB => self.load_count(&mut ch, idx, (data as u16) << 8, now),
                    RW_STATE_WORD0 => {
                        ch.write_latch = data;
                        ch.write_state = RW_STATE_WORD1;
                    }
                    RW_STATE_WORD1 => {
                        let val = ch.write_latch as u16 | ((data as u16) << 8);
                        self.load_count(&mut ch, idx, val, now);
                        ch.write_state = RW_STATE_WORD0;
                    }
                    state => panic!("invalid PIT write state {state:#x}"),
                }
                Ok(())
            }
            GATE_PORT => {
                // Port 0x61 also carries speaker control; only the
                // channel-2 gate bit is modelled.
                let mut ch = self.channels[2].lock();
                self.set_gate(&mut ch, data & 0x1, now);
                Ok(())
            }
            _ => Err(super::VdevError::BadPort),
        }
    }

    /// Guest read of `port` at guest TSC `now`.
    pub fn ioport_read(&self, port: u16, now: u64) -> Result<u8, super::VdevError> {
        match port {
            CHANNEL0_PORT | CHANNEL1_PORT | CHANNEL2_PORT => {
                let idx = (port - CHANNEL0_PORT) as usize;
                let mut ch = self.channels[idx].lock();
                let ret = if ch.status_latched {
                    ch.status_latched = false;
                    ch.status
                } else if ch.count_latched != 0 {
                    match ch.count_latched {
                        RW_STATE_LSB => {
                            ch.count_latched = 0;
                            (ch.latched_count & 0xff) as u8
                        }
                        RW_STATE_MSB => {
                            ch.count_latched = 0;
                            (ch.latched_count >> 8) as u8
                        }
                        RW_STATE_WORD0 => {
                            ch.count_latched = RW_STATE_MSB;
                            (ch.latched_count & 0xff) as u8
                        }
                        state => panic!("invalid PIT read state {state:#x}"),
                    }
                } else {
                    match ch.read_state {
                        RW_STATE_LSB => (self.get_count(&ch, now) & 0xff) as u8,
                        RW_STATE_MSB => ((self.get_count(&ch, now) >> 8) & 0xff) as u8,
                        RW_STATE_WORD0 => {
                            ch.read_state = RW_STATE_WORD1;
                            (self.get_count(&ch, now) & 0xff) as u8
                        }
                        RW_STATE_WORD1 => {
                            ch.read_state = RW_STATE_WORD0;
                            ((self.get_count(&ch, now) >> 8) & 0xff) as u8
                        }
                        state => panic!("invalid PIT read state {state:#x}"),
                    }
                };
                Ok(ret)
            }
            GATE_PORT => {
                let ch = self.channels[2].lock();
                Ok(((self.get_out(&ch, now) as u8) << 5) | ch.gate)
            }
            _ => Err(super::VdevError::BadPort),
        }
    }

    /// Periodic update: fire due interrupts and re-arm the channels.
    pub fn update(&self, now: u64) {
        for (i, slot) in self.channels.iter().enumerate() {
            let mut ch = slot.lock();
            if ch.enabled {
                self.channel_update(&mut ch, i == 0, now);
            }
        }
    }

    /// Drain the interrupts raised since the last call.
    pub fn take_irqs(&self) -> Vec<IrqAssert> {
        core::mem::take(&mut *self.irq_events.lock())
    }

    /// Current OUT pin of `channel` (diagnostic).
    pub fn out(&self, channel: usize, now: u64) -> bool {
        let ch = self.channels[channel].lock();
        self.get_out(&ch, now)
    }

    /// Loaded count of `channel` (diagnostic).
    pub fn initial_count(&self, channel: usize) -> u32 {
        self.channels[channel].lock().count
    }

    /// Counter mode of `channel` (diagnostic).
    pub fn mode(&self, channel: usize) -> u8 {
        self.channels[channel].lock().mode
    }

    /// Live remaining count of `channel`.
    pub fn current_count(&self, channel: usize, now: u64) -> u32 {
        let ch = self.channels[channel].lock();
        self.get_count(&ch, now)
    }

    /// Guest TSC of the next OUT transition of `channel`.
    pub fn next_transition(&self, channel: usize, now: u64) -> Option<u64> {
        let ch = self.channels[channel].lock();
        self.next_transition_time(&ch, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1000 guest TSC ticks per PIT cycle keeps the conversions exact.
    const TSC_HZ: u64 = 1000 * PIT_FREQ as u64;

    fn pit() -> Pit {
        Pit::new(TSC_HZ)
    }

    /// Guest TSC ticks after `n` PIT cycles.
    fn cycles(n: u64) -> u64 {
        n * 1000
    }

    fn program_mode2_count(p: &Pit, count: u16, now: u64) {
        // Channel 0, word access, mode 2, binary.
        p.ioport_write(0x43, 0x34, now).unwrap();
        p.ioport_write(0x40, (count & 0xff) as u8, now).unwrap();
        p.ioport_write(0x40, (count >> 8) as u8, now).unwrap();
    }

    #[test]
    fn muldiv64_matches_u128_reference() {
        let cases = [
            (0u64, 1u32, 1u32),
            (u64::MAX, 1, 1),
            (u64::MAX, u32::MAX, u32::MAX),
            (1 << 63, 3, 7),
            (0xffff_ffff, u32::MAX, 3),
            (123_456_789_012_345, 1_193_182, 1_000_000_000),
            (0x1234_5678_9abc_def0, 0xdead, 0xbeef),
        ];
        for (a, b, c) in cases {
            let want = ((a as u128 * b as u128) / c as u128) as u64;
            assert_eq!(muldiv64(a, b, c), want, "muldiv64({a}, {b}, {c})");
        }
    }

    #[test]
    fn muldiv64_randomized_against_reference() {
        // Deterministic xorshift; no RNG dependencies in the kernel.
        let mut x = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };
        for _ in 0..1000 {
            let a = next();
            let b = (next() as u32).max(1);
            let c = (next() as u32).max(1);
            let want = ((a as u128 * b as u128) / c as u128) as u64;
            assert_eq!(muldiv64(a, b, c), want);
        }
    }

    #[test]
    fn word_write_programs_the_count() {
        let p = pit();
        program_mode2_count(&p, 0x0400, 0);
        assert_eq!(p.mode(0), 2);
        assert_eq!(p.initial_count(0), 0x0400);
    }

    #[test]
    fn zero_count_means_65536() {
        let p = pit();
        p.ioport_write(0x43, 0x34, 0).unwrap();
        p.ioport_write(0x40, 0, 0).unwrap();
        p.ioport_write(0x40, 0, 0).unwrap();
        assert_eq!(p.initial_count(0), 0x10000);
    }

    #[test]
    fn mode2_interrupts_once_per_period() {
        let p = pit();
        program_mode2_count(&p, 0x0400, 0);
        assert!(p.take_irqs().is_empty());

        // Just before the first period boundary: nothing.
        p.update(cycles(0x0400) - 1);
        assert!(p.take_irqs().is_empty());

        // At the boundary: exactly one assertion at level 2.
        p.update(cycles(0x0400));
        let irqs = p.take_irqs();
        assert_eq!(irqs, [IrqAssert { irq: IRQ_TIMER, level: 2 }]);

        // Repeated updates within the same period stay quiet.
        p.update(cycles(0x0400) + 5);
        p.update(cycles(0x0400) + 50);
        assert!(p.take_irqs().is_empty());

        // Each following period fires exactly once.
        for k in 2..5u64 {
            p.update(cycles(0x0400 * k) + 1);
            assert_eq!(p.take_irqs().len(), 1, "period {k}");
        }
    }

    #[test]
    fn mode0_is_one_shot() {
        let p = pit();
        // Channel 0, word access, mode 0.
        p.ioport_write(0x43, 0x30, 0).unwrap();
        p.ioport_write(0x40, 0x10, 0).unwrap();
        p.ioport_write(0x40, 0x00, 0).unwrap();

        p.update(cycles(0x10));
        assert_eq!(p.take_irqs().len(), 1);

        // No re-arm: later updates never fire again.
        p.update(cycles(0x1000));
        p.update(cycles(0x2000));
        assert!(p.take_irqs().is_empty());
    }

    #[test]
    fn mode2_count_wraps_per_period() {
        let p = pit();
        program_mode2_count(&p, 100, 0);
        assert_eq!(p.current_count(0, cycles(30)), 70);
        assert_eq!(p.current_count(0, cycles(130)), 70);
        assert_eq!(p.current_count(0, cycles(100)), 100);
    }

    #[test]
    fn mode3_out_is_a_square_wave() {
        let p = pit();
        // Channel 0, word access, mode 3.
        p.ioport_write(0x43, 0x36, 0).unwrap();
        p.ioport_write(0x40, 100, 0).unwrap();
        p.ioport_write(0x40, 0, 0).unwrap();

        // High for the first half, low for the second.
        assert!(p.out(0, cycles(10)));
        assert!(p.out(0, cycles(49)));
        assert!(!p.out(0, cycles(50)));
        assert!(!p.out(0, cycles(99)));
        assert!(p.out(0, cycles(100)));
    }

    #[test]
    fn counter_latch_freezes_the_read() {
        let p = pit();
        program_mode2_count(&p, 200, 0);

        // Latch at 50 cycles elapsed, then read LSB/MSB later.
        p.ioport_write(0x43, 0x00, cycles(50)).unwrap();
        let lsb = p.ioport_read(0x40, cycles(90)).unwrap();
        let msb = p.ioport_read(0x40, cycles(90)).unwrap();
        assert_eq!(((msb as u32) << 8) | lsb as u32, 150);

        // After the latch drains, reads are live again.
        let lsb = p.ioport_read(0x40, cycles(80)).unwrap();
        let msb = p.ioport_read(0x40, cycles(80)).unwrap();
        assert_eq!(((msb as u32) << 8) | lsb as u32, 120);
    }

    #[test]
    fn readback_latches_status_once() {
        let p = pit();
        program_mode2_count(&p, 100, 0);

        // Read-back: latch status (D4=0) of channel 0 (D1=1).
        p.ioport_write(0x43, 0xc2 | 0x20, cycles(10)).unwrap();
        let status = p.ioport_read(0x40, cycles(10)).unwrap();
        // OUT low early in a mode-2 period; RW=word; mode 2; binary.
        assert_eq!(status & 0x1, 0);
        assert_eq!((status >> 1) & 0x7, 2);
        assert_eq!((status >> 4) & 0x3, RW_STATE_WORD0 & 0x3);

        // The next read is a live count again, not status.
        let lsb = p.ioport_read(0x40, cycles(30)).unwrap();
        let msb = p.ioport_read(0x40, cycles(30)).unwrap();
        assert_eq!(((msb as u32) << 8) | lsb as u32, 70);
    }

    #[test]
    fn gate_port_drives_channel2() {
        let p = pit();
        // Channel 2, word access, mode 2.
        p.ioport_write(0x43, 0xb4, 0).unwrap();
        p.ioport_write(0x42, 100, 0).unwrap();
        p.ioport_write(0x42, 0, 0).unwrap();

        // Gate low, then rising edge at t=cycles(30) restarts counting.
        p.ioport_write(0x61, 0, cycles(10)).unwrap();
        p.ioport_write(0x61, 1, cycles(30)).unwrap();
        assert_eq!(p.current_count(2, cycles(40)), 90);

        // Bit 0 of port 0x61 reads back the gate.
        let val = p.ioport_read(0x61, cycles(40)).unwrap();
        assert_eq!(val & 0x1, 1);
    }

    #[test]
    fn unowned_ports_are_rejected() {
        let p = pit();
        assert!(p.ioport_write(0x44, 0, 0).is_err());
        assert!(p.ioport_read(0x60, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "BCD")]
    fn bcd_mode_faults() {
        let p = pit();
        p.ioport_write(0x43, 0x35, 0).unwrap();
    }

    #[test]
    fn next_transition_tracks_mode2_periods() {
        let p = pit();
        program_mode2_count(&p, 100, 0);
        // Early in the first period the next transition is its end.
        let t = p.next_transition(0, cycles(10)).unwrap();
        assert_eq!(t, cycles(101));
    }

    #[test]
    fn expired_one_shot_has_no_transition() {
        let p = pit();
        p.ioport_write(0x43, 0x30, 0).unwrap();
        p.ioport_write(0x40, 0x10, 0).unwrap();
        p.ioport_write(0x40, 0x00, 0).unwrap();
        assert!(p.next_transition(0, cycles(0x20)).is_none());
    }
}
