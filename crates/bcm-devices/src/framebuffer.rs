//! Mailbox-driven framebuffer controller.
//!
//! The guest writes the address of a 16-byte aligned descriptor to the framebuffer channel. The
//! controller reads the requested mode from guest memory, derives the scanline pitch, buffer size
//! and buffer address, and writes those back into the descriptor before signalling the mailbox.
//!
//! Only 16 bpp modes are implemented. Virtual resolution and panning fields are read but ignored:
//! the visible buffer always starts at `base` with a pitch of `xres * 2`.

use bcm_io_snapshot::io::state::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use memory::MemoryBus;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::consts::VCRAM_SIZE;
use crate::irq::IrqLine;
use crate::mailbox::{
    MailboxChannel, MailboxChannelId, MAILBOX_CHANNEL_WINDOW_SIZE, REG_IDENT, REG_STATUS,
};
use crate::mmio::RegisterDevice;

pub const FB_DESCRIPTOR_LEN: usize = 40;
pub const FB_SUPPORTED_BPP: u32 = 16;

const BYTES_PER_PIXEL: u64 = 2;
/// Low bits of a mailbox message carry the channel number.
const MESSAGE_ADDR_MASK: u32 = !0xf;
/// Address bits 30-31 select the SDRAM alias (cache policy) the GPU hands back.
const BANK_SELECT_MASK: u32 = 0xc000_0000;

const OFF_XRES: u64 = 0;
const OFF_YRES: u64 = 4;
const OFF_XRES_VIRTUAL: u64 = 8;
const OFF_YRES_VIRTUAL: u64 = 12;
const OFF_PITCH: u64 = 16;
const OFF_BPP: u64 = 20;
const OFF_XOFFSET: u64 = 24;
const OFF_YOFFSET: u64 = 28;
const OFF_BASE: u64 = 32;
const OFF_SIZE: u64 = 36;

/// Guest-resident framebuffer descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferConfig {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub base: u32,
    pub size: u32,
}

impl FramebufferConfig {
    fn fields(&self) -> [(u64, u32); 10] {
        [
            (OFF_XRES, self.xres),
            (OFF_YRES, self.yres),
            (OFF_XRES_VIRTUAL, self.xres_virtual),
            (OFF_YRES_VIRTUAL, self.yres_virtual),
            (OFF_PITCH, self.pitch),
            (OFF_BPP, self.bpp),
            (OFF_XOFFSET, self.xoffset),
            (OFF_YOFFSET, self.yoffset),
            (OFF_BASE, self.base),
            (OFF_SIZE, self.size),
        ]
    }

    pub fn read_from(mem: &mut impl MemoryBus, addr: u64) -> Self {
        let mut raw = [0u8; FB_DESCRIPTOR_LEN];
        mem.read_physical(addr, &mut raw);
        let word = |offset: u64| {
            let at = offset as usize;
            u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
        };
        Self {
            xres: word(OFF_XRES),
            yres: word(OFF_YRES),
            xres_virtual: word(OFF_XRES_VIRTUAL),
            yres_virtual: word(OFF_YRES_VIRTUAL),
            pitch: word(OFF_PITCH),
            bpp: word(OFF_BPP),
            xoffset: word(OFF_XOFFSET),
            yoffset: word(OFF_YOFFSET),
            base: word(OFF_BASE),
            size: word(OFF_SIZE),
        }
    }

    /// Store every field of the descriptor at `addr`.
    pub fn write_to(&self, mem: &mut impl MemoryBus, addr: u64) {
        let mut raw = [0u8; FB_DESCRIPTOR_LEN];
        for (offset, value) in self.fields() {
            let at = offset as usize;
            raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        mem.write_physical(addr, &raw);
    }

    /// Store only the fields the GPU fills in (`pitch`, `base`, `size`).
    pub fn write_outputs(&self, mem: &mut impl MemoryBus, addr: u64) {
        mem.write_u32(addr + OFF_PITCH, self.pitch);
        mem.write_u32(addr + OFF_BASE, self.base);
        mem.write_u32(addr + OFF_SIZE, self.size);
    }
}

/// Mode requests the emulated GPU cannot honour. These halt the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramebufferError {
    #[error("unsupported framebuffer depth {bpp} bpp (only {FB_SUPPORTED_BPP} bpp is implemented)")]
    UnsupportedDepth { bpp: u32 },
    #[error("framebuffer {xres}x{yres} needs {size} bytes, exceeding the {limit}-byte video RAM")]
    ResolutionTooLarge {
        xres: u32,
        yres: u32,
        size: u64,
        limit: u64,
    },
}

/// One refresh worth of 16 bpp (RGB565) scanout data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutFrame<'a> {
    pub width: u32,
    pub height: u32,
    /// Source bytes per scanline.
    pub stride: u32,
    /// The whole surface must be repainted, not just what changed.
    pub full_repaint: bool,
    pub pixels: &'a [u8],
}

/// Host-side presentation target.
pub trait DisplaySurface {
    /// Called from [`FramebufferController::update_display`], not from the mode set itself: a
    /// mode set only records the new size, and the surface sees it on the next refresh, just
    /// before the first frame in that mode. Several mode sets between refreshes collapse into
    /// one resize to the latest size.
    fn resize(&mut self, width: u32, height: u32);

    /// Returns `false` if the frame could not be presented; it will be offered again (with the
    /// repaint flag preserved) on the next refresh.
    fn present(&mut self, frame: &ScanoutFrame<'_>) -> bool;
}

pub struct FramebufferController<M: MemoryBus, I: IrqLine> {
    mem: M,
    vcram_base: u32,
    mailbox: MailboxChannel<I>,
    config: FramebufferConfig,
    enabled: bool,
    invalidate: bool,
    pending_resize: Option<(u32, u32)>,
    fatal: Option<FramebufferError>,
    scanout: Vec<u8>,
}

impl<M: MemoryBus, I: IrqLine> FramebufferController<M, I> {
    /// `vcram_base` is the guest-physical start of the video RAM region.
    pub fn new(mem: M, vcram_base: u32, irq: I) -> Self {
        Self {
            mem,
            vcram_base,
            mailbox: MailboxChannel::new(MailboxChannelId::FRAMEBUFFER, irq),
            config: FramebufferConfig::default(),
            enabled: false,
            invalidate: false,
            pending_resize: None,
            fatal: None,
            scanout: Vec::new(),
        }
    }

    pub fn vcram_base(&self) -> u32 {
        self.vcram_base
    }

    pub fn config(&self) -> &FramebufferConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &MailboxChannel<I> {
        &self.mailbox
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn needs_full_repaint(&self) -> bool {
        self.invalidate
    }

    pub fn fatal(&self) -> Option<&FramebufferError> {
        self.fatal.as_ref()
    }

    pub fn take_fatal(&mut self) -> Option<FramebufferError> {
        self.fatal.take()
    }

    /// Handle a message written to the framebuffer mailbox channel.
    ///
    /// Ignored while a previous request is still unacknowledged. On an unsupported mode the
    /// error is latched for the platform, guest memory is left untouched and the mailbox is not
    /// signalled.
    pub fn push(&mut self, message: u32) {
        if self.mailbox.is_pending() {
            warn!(
                target: "guest_error",
                message, "framebuffer request while previous request is unacknowledged"
            );
            return;
        }
        match self.configure(message) {
            Ok(()) => self.mailbox.push(),
            Err(err) => {
                error!(%err, message, "framebuffer configuration rejected");
                self.fatal = Some(err);
            }
        }
    }

    fn configure(&mut self, message: u32) -> Result<(), FramebufferError> {
        let addr = message & MESSAGE_ADDR_MASK;
        let mut config = FramebufferConfig::read_from(&mut self.mem, u64::from(addr));

        if config.bpp != FB_SUPPORTED_BPP {
            return Err(FramebufferError::UnsupportedDepth { bpp: config.bpp });
        }

        let pitch = u64::from(config.xres) * BYTES_PER_PIXEL;
        let size = u64::from(config.yres) * pitch;
        if size > VCRAM_SIZE {
            return Err(FramebufferError::ResolutionTooLarge {
                xres: config.xres,
                yres: config.yres,
                size,
                limit: VCRAM_SIZE,
            });
        }

        // A zero-height mode can carry any width; the register keeps the low 32 bits.
        config.pitch = pitch as u32;
        config.size = size as u32;
        config.base = self.vcram_base | (addr & BANK_SELECT_MASK);
        config.write_outputs(&mut self.mem, u64::from(addr));

        debug!(
            xres = config.xres,
            yres = config.yres,
            pitch = config.pitch,
            base = config.base,
            size = config.size,
            "framebuffer configured"
        );

        self.config = config;
        self.pending_resize = Some((config.xres, config.yres));
        self.enabled = true;
        self.invalidate = true;
        Ok(())
    }

    /// Request a full repaint on the next refresh.
    pub fn invalidate_display(&mut self) {
        self.invalidate = true;
    }

    /// Present the current framebuffer contents to `surface`.
    ///
    /// Returns whether a frame was presented. Does nothing until the guest has configured a mode.
    pub fn update_display(&mut self, surface: &mut impl DisplaySurface) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some((width, height)) = self.pending_resize.take() {
            surface.resize(width, height);
        }

        self.scanout.resize(self.config.size as usize, 0);
        self.mem
            .read_physical(u64::from(self.config.base), &mut self.scanout);

        let frame = ScanoutFrame {
            width: self.config.xres,
            height: self.config.yres,
            stride: self.config.pitch,
            full_repaint: self.invalidate,
            pixels: &self.scanout,
        };
        let presented = surface.present(&frame);
        if presented {
            self.invalidate = false;
        }
        presented
    }
}

impl<M: MemoryBus, I: IrqLine> RegisterDevice for FramebufferController<M, I> {
    const NAME: &'static str = "framebuffer";
    const WINDOW_SIZE: u64 = MAILBOX_CHANNEL_WINDOW_SIZE;

    fn read_reg(&mut self, offset: u64) -> Option<u32> {
        match offset {
            REG_IDENT => Some(self.mailbox.acknowledge()),
            REG_STATUS => Some(self.mailbox.status()),
            _ => None,
        }
    }

    fn write_reg(&mut self, offset: u64, value: u32) -> bool {
        match offset {
            REG_IDENT => {
                self.push(value);
                true
            }
            _ => false,
        }
    }
}

impl<M: MemoryBus, I: IrqLine> IoSnapshot for FramebufferController<M, I> {
    const DEVICE_ID: [u8; 4] = *b"BCFB";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    // Nothing is persisted; restoring only clears the mailbox latch.
    fn save_state(&self) -> Vec<u8> {
        SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION).finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        self.mailbox.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use memory::{AliasedGuestMemory, DenseMemory, SharedGuestMemory};
    use pretty_assertions::assert_eq;

    use super::*;

    const VCRAM_BASE: u32 = 0x0010_0000;

    #[derive(Default)]
    struct Level(Cell<bool>);

    impl IrqLine for Level {
        fn set_level(&self, level: bool) {
            self.0.set(level);
        }
    }

    #[derive(Default)]
    struct Surface {
        resizes: Vec<(u32, u32)>,
        frames: Vec<(u32, u32, u32, bool, usize)>,
        accept: bool,
    }

    impl DisplaySurface for Surface {
        fn resize(&mut self, width: u32, height: u32) {
            self.resizes.push((width, height));
        }

        fn present(&mut self, frame: &ScanoutFrame<'_>) -> bool {
            self.frames.push((
                frame.width,
                frame.height,
                frame.stride,
                frame.full_repaint,
                frame.pixels.len(),
            ));
            self.accept
        }
    }

    fn controller() -> (SharedGuestMemory, FramebufferController<SharedGuestMemory, Level>) {
        let ram = SharedGuestMemory::new(Box::new(DenseMemory::new(0x20_0000).unwrap()));
        let fb = FramebufferController::new(ram.clone(), VCRAM_BASE, Level::default());
        (ram, fb)
    }

    fn request(xres: u32, yres: u32, bpp: u32) -> FramebufferConfig {
        FramebufferConfig {
            xres,
            yres,
            xres_virtual: xres,
            yres_virtual: yres,
            bpp,
            ..Default::default()
        }
    }

    #[test]
    fn descriptor_words_sit_at_fixed_offsets() {
        let (mut ram, _fb) = controller();
        let config = FramebufferConfig {
            pitch: 0x55,
            xoffset: 7,
            yoffset: 9,
            base: 0xdead_0000,
            size: 0x1234,
            ..request(640, 480, 16)
        };
        config.write_to(&mut ram, 0x3000);

        let words: Vec<u32> = (0..FB_DESCRIPTOR_LEN as u64)
            .step_by(4)
            .map(|offset| ram.read_u32(0x3000 + offset))
            .collect();
        assert_eq!(
            words,
            vec![640, 480, 640, 480, 0x55, 16, 7, 9, 0xdead_0000, 0x1234]
        );
        assert_eq!(ram.read_u32(0x3000 + FB_DESCRIPTOR_LEN as u64), 0);
        assert_eq!(FramebufferConfig::read_from(&mut ram, 0x3000), config);
    }

    #[test]
    fn mode_set_reaches_the_surface_on_the_next_refresh() {
        let (mut ram, mut fb) = controller();
        request(320, 240, 16).write_to(&mut ram, 0x1000);
        request(64, 32, 16).write_to(&mut ram, 0x2000);

        fb.push(0x1000);
        assert_eq!(fb.read_reg(REG_IDENT), Some(1));
        fb.push(0x2000);

        let mut surface = Surface {
            accept: true,
            ..Default::default()
        };
        assert!(fb.update_display(&mut surface));
        assert_eq!(surface.resizes, vec![(64, 32)]);
        assert!(fb.update_display(&mut surface));
        assert_eq!(surface.resizes, vec![(64, 32)]);
    }

    #[test]
    fn derives_geometry_and_writes_it_back() {
        let (mut ram, mut fb) = controller();
        request(320, 240, 16).write_to(&mut ram, 0x2000);

        fb.push(0x2000 | 0x1);

        let written = FramebufferConfig::read_from(&mut ram, 0x2000);
        assert_eq!(
            written,
            FramebufferConfig {
                pitch: 640,
                base: VCRAM_BASE,
                size: 153_600,
                ..request(320, 240, 16)
            }
        );
        assert_eq!(fb.config(), &written);
        assert!(fb.is_enabled());
        assert!(fb.needs_full_repaint());
        assert!(fb.mailbox().is_pending());
        assert!(fb.mailbox().irq().0.get());
    }

    #[test]
    fn bank_select_bits_carry_into_base() {
        let banks = AliasedGuestMemory::mirrored(
            Box::new(DenseMemory::new(0x20_0000).unwrap()),
            1 << 30,
            4,
        )
        .unwrap();
        let mut ram = SharedGuestMemory::new(Box::new(banks));
        let mut fb = FramebufferController::new(ram.clone(), VCRAM_BASE, Level::default());
        request(16, 16, 16).write_to(&mut ram, 0x3000);

        fb.push(0xc000_3000);

        assert_eq!(fb.config().base, 0xc000_0000 | VCRAM_BASE);
        assert_eq!(ram.read_u32(0x3000 + OFF_BASE), 0xc000_0000 | VCRAM_BASE);
        assert_eq!(ram.read_u32(0x3000 + OFF_SIZE), 512);
    }

    #[test]
    fn unsupported_depth_is_latched_and_leaves_memory_alone() {
        let (mut ram, mut fb) = controller();
        request(640, 480, 32).write_to(&mut ram, 0x1000);

        fb.push(0x1000);

        assert_eq!(
            fb.fatal(),
            Some(&FramebufferError::UnsupportedDepth { bpp: 32 })
        );
        assert!(!fb.mailbox().is_pending());
        assert!(!fb.is_enabled());
        assert_eq!(FramebufferConfig::read_from(&mut ram, 0x1000).pitch, 0);
    }

    #[test]
    fn oversized_mode_is_rejected() {
        let (mut ram, mut fb) = controller();
        request(8192, 8192, 16).write_to(&mut ram, 0x1000);

        fb.push(0x1000);

        assert_eq!(
            fb.take_fatal(),
            Some(FramebufferError::ResolutionTooLarge {
                xres: 8192,
                yres: 8192,
                size: 8192 * 8192 * 2,
                limit: VCRAM_SIZE,
            })
        );
        assert_eq!(fb.take_fatal(), None);
    }

    #[test]
    fn push_while_pending_is_ignored() {
        let (mut ram, mut fb) = controller();
        request(320, 240, 16).write_to(&mut ram, 0x1000);
        request(64, 64, 16).write_to(&mut ram, 0x2000);

        fb.push(0x1000);
        fb.push(0x2000);
        assert_eq!(fb.config().xres, 320);
        assert_eq!(FramebufferConfig::read_from(&mut ram, 0x2000).pitch, 0);

        assert_eq!(fb.read_reg(REG_IDENT), Some(1));
        fb.push(0x2000);
        assert_eq!(fb.config().xres, 64);
    }

    #[test]
    fn presentation_clears_invalidate_only_on_success() {
        let (mut ram, mut fb) = controller();
        let mut surface = Surface::default();
        assert!(!fb.update_display(&mut surface));
        assert!(surface.frames.is_empty());

        request(8, 4, 16).write_to(&mut ram, 0x1000);
        fb.push(0x1000);

        assert!(!fb.update_display(&mut surface));
        assert!(fb.needs_full_repaint());

        surface.accept = true;
        assert!(fb.update_display(&mut surface));
        assert!(!fb.needs_full_repaint());
        assert!(fb.update_display(&mut surface));

        fb.invalidate_display();
        assert!(fb.update_display(&mut surface));

        assert_eq!(surface.resizes, vec![(8, 4)]);
        assert_eq!(
            surface.frames,
            vec![
                (8, 4, 16, true, 64),
                (8, 4, 16, true, 64),
                (8, 4, 16, false, 64),
                (8, 4, 16, true, 64),
            ]
        );
    }

    #[test]
    fn scanout_reads_video_ram() {
        let (mut ram, mut fb) = controller();
        request(2, 1, 16).write_to(&mut ram, 0x1000);
        ram.write_physical(u64::from(VCRAM_BASE), &[0x1f, 0x00, 0xe0, 0x07]);
        fb.push(0x1000);

        struct Capture(Vec<u8>);
        impl DisplaySurface for Capture {
            fn resize(&mut self, _width: u32, _height: u32) {}

            fn present(&mut self, frame: &ScanoutFrame<'_>) -> bool {
                self.0 = frame.pixels.to_vec();
                true
            }
        }

        let mut capture = Capture(Vec::new());
        fb.update_display(&mut capture);
        assert_eq!(capture.0, vec![0x1f, 0x00, 0xe0, 0x07]);
    }
}
