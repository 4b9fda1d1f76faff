use bcm2835_emu::devices::mailbox::MailboxChannelId;
use bcm2835_emu::io_snapshot::io::state::IoSnapshot;
use bcm2835_emu::platform::interrupts::IrqSource;
use bcm2835_emu::platform::memory_map::{bus_alias, mailbox_device_base, SYSTEM_TIMER_BASE};
use bcm2835_emu::time::{Clock, ManualClock};
use bcm2835_emu::{Bcm2835, PlatformConfig};
use pretty_assertions::assert_eq;

const ST_CS: u64 = SYSTEM_TIMER_BASE;
const ST_CLO: u64 = SYSTEM_TIMER_BASE + 0x04;
const ST_CHI: u64 = SYSTEM_TIMER_BASE + 0x08;

fn st_compare(channel: u64) -> u64 {
    SYSTEM_TIMER_BASE + 0x0c + 4 * channel
}

fn board(clock: &ManualClock) -> Bcm2835<ManualClock> {
    let config = PlatformConfig {
        ram_size_bytes: 128 * 1024 * 1024,
        vblank_hz: 100,
    };
    Bcm2835::with_clock(config, clock.clone()).unwrap()
}

/// Run wake-ups in deadline order until the system timer has ticked.
fn step(clock: &ManualClock, machine: &mut Bcm2835<ManualClock>) {
    loop {
        let deadline = machine.next_deadline_ns().expect("nothing scheduled");
        clock.set_ns(deadline.max(clock.now_ns()));
        if machine.poll().unwrap().timer_ticks > 0 {
            return;
        }
    }
}

#[test]
fn compare_across_counter_wrap() {
    let clock = ManualClock::new();
    let start_us = (1u64 << 32) - 5;
    clock.set_ns(start_us * 1000);
    let mut machine = board(&clock);

    assert_eq!(machine.read_u32(ST_CLO), 0xffff_fffb);
    assert_eq!(machine.read_u32(ST_CHI), 0);

    machine.write_u32(st_compare(2), 10);

    // Channels still at compare 0 match as the low word wraps.
    step(&clock, &mut machine);
    assert_eq!(clock.now_ns(), (1u64 << 32) * 1000);
    assert_eq!(machine.read_u32(ST_CS), 0b1011);

    step(&clock, &mut machine);
    assert_eq!(clock.now_ns(), ((1u64 << 32) + 10) * 1000);
    assert_eq!(machine.read_u32(ST_CS), 0b1111);
    assert_eq!(machine.read_u32(ST_CLO), 10);
    assert_eq!(machine.read_u32(ST_CHI), 1);
    assert!(machine.interrupts().is_asserted(IrqSource::SystemTimer(2)));
}

#[test]
fn restored_board_keeps_its_schedule() {
    let clock = ManualClock::new();
    let mut machine = board(&clock);
    for (channel, compare) in [1000, 2000, 3000, 4000].into_iter().enumerate() {
        machine.write_u32(st_compare(channel as u64), compare);
    }
    clock.set_ns(1_500_000);
    machine.poll().unwrap();
    assert_eq!(machine.read_u32(ST_CS), 0b0001);
    let snapshot = machine.save_state();

    let restored_clock = ManualClock::new();
    let mut restored = board(&restored_clock);
    restored_clock.set_ns(1_500_000);
    restored.load_state(&snapshot).unwrap();

    assert_eq!(restored.read_u32(ST_CS), 0b0001);
    assert!(restored.interrupts().is_asserted(IrqSource::SystemTimer(0)));
    assert_eq!(restored.next_deadline_ns(), Some(2_000_000));

    step(&restored_clock, &mut restored);
    assert_eq!(restored.read_u32(ST_CS), 0b0011);
    assert_eq!(restored.read_u32(st_compare(3)), 4000);
}

#[test]
fn framebuffer_request_through_bus_alias_and_cache_bank() {
    let clock = ManualClock::new();
    let mut machine = board(&clock);
    let fb_mbox = bus_alias(mailbox_device_base(MailboxChannelId::FRAMEBUFFER));

    let request = [320u32, 240, 320, 240, 0, 16, 0, 0, 0, 0];
    for (i, word) in request.into_iter().enumerate() {
        machine.write_u32(0x2000 + 4 * i as u64, word);
    }

    // Descriptor addressed through the L2-coherent bank; the low nibble is ignored.
    machine.write_u32(fb_mbox, 0x4000_2005);
    assert_eq!(machine.read_u32(fb_mbox + 4), 1);
    assert!(machine
        .interrupts()
        .is_asserted(IrqSource::Mailbox(MailboxChannelId::FRAMEBUFFER)));

    assert_eq!(machine.read_u32(0x2010), 640);
    assert_eq!(machine.read_u32(0x2020), 0x4000_0000 | 0x0400_0000);
    assert_eq!(machine.read_u32(0x2024), 320 * 240 * 2);

    assert_eq!(machine.read_u32(fb_mbox), 1);
    assert_eq!(machine.read_u32(fb_mbox + 4), 0);
    assert!(!machine
        .interrupts()
        .is_asserted(IrqSource::Mailbox(MailboxChannelId::FRAMEBUFFER)));
}
