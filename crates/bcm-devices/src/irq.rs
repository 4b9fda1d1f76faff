use std::rc::Rc;

/// Level-triggered interrupt output.
///
/// Devices hold a handle and drive it with the level of their interrupt condition. The line
/// itself is owned by whoever routes it; driving the same level twice is harmless.
pub trait IrqLine {
    fn set_level(&self, level: bool);

    fn raise(&self) {
        self.set_level(true);
    }

    fn lower(&self) {
        self.set_level(false);
    }
}

impl<T: IrqLine + ?Sized> IrqLine for &T {
    fn set_level(&self, level: bool) {
        (**self).set_level(level);
    }
}

impl<T: IrqLine + ?Sized> IrqLine for Rc<T> {
    fn set_level(&self, level: bool) {
        (**self).set_level(level);
    }
}

impl<T: IrqLine + ?Sized> IrqLine for Box<T> {
    fn set_level(&self, level: bool) {
        (**self).set_level(level);
    }
}

/// Unconnected interrupt output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn set_level(&self, _level: bool) {}
}
