//! Physical interval-timer bring-up.
//!
//! The boot path programs the physical 8253 channel 0 as a rate
//! generator before the LAPIC timer takes over as the scheduling clock.
//! The guest-facing PIT model lives in [`crate::virt::vdev::pit`].

use crate::arch::Platform;
use crate::config::PIT_FREQ;

/// 8253 channel 0 data port.
const IO_TIMER1: u16 = 0x40;
/// 8253 mode/control port.
const TIMER_MODE: u16 = IO_TIMER1 + 3;
/// Select counter 0.
const TIMER_SEL0: u8 = 0x00;
/// Mode 2, rate generator.
const TIMER_RATEGEN: u8 = 0x04;
/// Read/write 16 bits, LSB first.
const TIMER_16BIT: u8 = 0x30;

/// Boot-path tick rate of the physical timer, in Hz.
const TIMER_BOOT_HZ: u32 = 100;

/// Counter value generating `freq` interrupts per second, rounded to the
/// nearest count.
fn timer_div(freq: u32) -> u32 {
    (PIT_FREQ + freq / 2) / freq
}

/// Program physical channel 0 as a 100 Hz rate generator.
pub fn timer_hw_init(plat: &Platform) {
    let div = timer_div(TIMER_BOOT_HZ);
    plat.outb(TIMER_MODE, TIMER_SEL0 | TIMER_RATEGEN | TIMER_16BIT);
    plat.outb(IO_TIMER1, (div % 256) as u8);
    plat.outb(IO_TIMER1, (div / 256) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchEvent;

    #[test]
    fn divisor_rounds_to_nearest() {
        // 1193182 / 100 = 11931.82, rounded up.
        assert_eq!(timer_div(100), 11932);
        assert_eq!(timer_div(PIT_FREQ), 1);
    }

    #[test]
    fn init_programs_mode_then_lsb_msb() {
        let plat = Platform::new();
        timer_hw_init(&plat);
        let div = timer_div(100);
        assert_eq!(
            plat.take_events(),
            [
                ArchEvent::PortWrite(0x43, 0x34),
                ArchEvent::PortWrite(0x40, (div % 256) as u8),
                ArchEvent::PortWrite(0x40, (div / 256) as u8),
            ]
        );
    }
}
