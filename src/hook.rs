//! Trace event hook.
//!
//! [`TraceHook`] owns the registration of both notification points with the host
//! and turns raw [`DebuggerNotification`]s into [`HookEvent`]s. Step and breakpoint
//! notifications become [`InstructionEvent`]s: the code bytes at the stop address
//! are read through the concrete state bridge, decoded by the injected
//! [`InstructionDecoder`], and the operands are resolved against the live process.
//!
//! Installation is atomic: either both points are hooked, or none is. Uninstalling
//! is idempotent.

use std::sync::Arc;

use crate::{
    bridge::ConcreteStateSource,
    engine::Architecture,
    host::{
        DebuggerNotification, InstructionDecoder, NotificationPoint, NotificationSource, PAGE_SIZE,
    },
    instruction::InstructionEvent,
    Error, Result,
};

/// Longest x86 instruction in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

const POINTS: [NotificationPoint; 2] = [NotificationPoint::Ui, NotificationPoint::Debugger];

/// A host notification translated for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// The debuggee is about to execute an instruction.
    Instruction(InstructionEvent),
    /// A new process started.
    ProcessStarted {
        /// Identifier of the new process
        pid: u32,
    },
    /// The debugged process exited.
    ProcessExited {
        /// Identifier of the exited process
        pid: u32,
        /// Exit code
        code: i32,
    },
    /// The host UI is closing.
    UiClosing,
}

/// Registers for host notifications and translates them.
pub struct TraceHook {
    notifications: Arc<dyn NotificationSource>,
    decoder: Arc<dyn InstructionDecoder>,
    installed: Vec<NotificationPoint>,
}

impl TraceHook {
    /// Creates an uninstalled hook.
    #[must_use]
    pub fn new(
        notifications: Arc<dyn NotificationSource>,
        decoder: Arc<dyn InstructionDecoder>,
    ) -> Self {
        Self {
            notifications,
            decoder,
            installed: Vec::with_capacity(POINTS.len()),
        }
    }

    /// Hooks the UI and debugger notification points.
    ///
    /// If any registration fails, every point hooked by this call is unhooked
    /// again before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HookInstallation`] naming the point that failed.
    pub fn install(&mut self) -> Result<()> {
        for point in POINTS {
            if self.installed.contains(&point) {
                continue;
            }
            if let Err(error) = self.notifications.hook(point) {
                log::warn!("hooking {point} failed, rolling back");
                self.uninstall();
                return Err(match error {
                    Error::HookInstallation { .. } => error,
                    other => Error::HookInstallation {
                        point,
                        reason: other.to_string(),
                    },
                });
            }
            log::debug!("hooked {point} notifications");
            self.installed.push(point);
        }
        Ok(())
    }

    /// Unhooks every installed point. Calling it again does nothing.
    pub fn uninstall(&mut self) {
        while let Some(point) = self.installed.pop() {
            self.notifications.unhook(point);
            log::debug!("unhooked {point} notifications");
        }
    }

    /// Returns true if both notification points are hooked.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.len() == POINTS.len()
    }

    /// Translates a host notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if the code bytes or an address
    /// register cannot be read, and [`Error::Undecodable`] if the decoder rejects
    /// the bytes.
    pub fn translate(
        &self,
        notification: DebuggerNotification,
        arch: Architecture,
        source: &dyn ConcreteStateSource,
    ) -> Result<HookEvent> {
        match notification {
            DebuggerNotification::Step { pc, next_pc }
            | DebuggerNotification::Breakpoint { pc, next_pc } => self
                .instruction(pc, arch, source)
                .map(|event| HookEvent::Instruction(event.with_next_pc(next_pc))),
            DebuggerNotification::ProcessStart { pid } => Ok(HookEvent::ProcessStarted { pid }),
            DebuggerNotification::ProcessExit { pid, code } => {
                Ok(HookEvent::ProcessExited { pid, code })
            }
            DebuggerNotification::UiClosing => Ok(HookEvent::UiClosing),
        }
    }

    fn instruction(
        &self,
        pc: u64,
        arch: Architecture,
        source: &dyn ConcreteStateSource,
    ) -> Result<InstructionEvent> {
        let bytes = read_code(pc, source)?;
        let (instruction, len) = self
            .decoder
            .decode(arch, pc, &bytes)
            .filter(|(_, len)| (1..=bytes.len()).contains(len))
            .ok_or(Error::Undecodable { pc })?;
        let mut bytes = bytes;
        bytes.truncate(len);
        InstructionEvent::resolve(pc, bytes, instruction, arch, source)
    }
}

impl std::fmt::Debug for TraceHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceHook")
            .field("installed", &self.installed)
            .finish_non_exhaustive()
    }
}

/// Reads up to [`MAX_INSTRUCTION_LEN`] code bytes, stopping at the page end if the
/// next page is not readable.
fn read_code(pc: u64, source: &dyn ConcreteStateSource) -> Result<Vec<u8>> {
    match source.read_concrete_memory(pc, MAX_INSTRUCTION_LEN) {
        Ok(bytes) => Ok(bytes),
        Err(error) => {
            let to_page_end = PAGE_SIZE - (pc % PAGE_SIZE as u64) as usize;
            if to_page_end < MAX_INSTRUCTION_LEN {
                source.read_concrete_memory(pc, to_page_end)
            } else {
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::DebuggeeBridge,
        host::{RecordingNotificationSource, ScriptedDecoder, SimulatedDebuggee},
        instruction::{AccessKind, Instruction, Location, Operand, Register},
    };

    fn hook() -> (Arc<RecordingNotificationSource>, Arc<ScriptedDecoder>, TraceHook) {
        let notifications = Arc::new(RecordingNotificationSource::new());
        let decoder = Arc::new(ScriptedDecoder::new());
        let hook = TraceHook::new(notifications.clone(), decoder.clone());
        (notifications, decoder, hook)
    }

    #[test]
    fn test_install_is_atomic() {
        let (notifications, _, mut hook) = hook();
        notifications.refuse(NotificationPoint::Debugger);
        match hook.install() {
            Err(Error::HookInstallation { point, .. }) => {
                assert_eq!(point, NotificationPoint::Debugger);
            }
            other => panic!("expected HookInstallation, got {other:?}"),
        }
        assert!(!hook.is_installed());
        assert!(!notifications.is_hooked(NotificationPoint::Ui));

        notifications.accept(NotificationPoint::Debugger);
        hook.install().unwrap();
        assert!(hook.is_installed());
        assert!(notifications.is_hooked(NotificationPoint::Ui));
        assert!(notifications.is_hooked(NotificationPoint::Debugger));
    }

    #[test]
    fn test_uninstall_is_idempotent() {
        let (notifications, _, mut hook) = hook();
        hook.install().unwrap();
        hook.uninstall();
        hook.uninstall();
        assert!(!notifications.is_hooked(NotificationPoint::Ui));
        assert!(!hook.is_installed());
    }

    #[test]
    fn test_translate_step() {
        let (_, decoder, hook) = hook();
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86_64));
        debuggee.map(0x1000, 0x1000).unwrap();
        let bridge = DebuggeeBridge::new(debuggee);
        decoder.insert(
            0x1ffe,
            Instruction::Inc {
                dst: Operand::Register(Register::Ecx),
            },
            2,
        );

        let event = hook
            .translate(
                DebuggerNotification::Step {
                    pc: 0x1ffe,
                    next_pc: Some(0x2000),
                },
                Architecture::X86_64,
                &bridge,
            )
            .unwrap();
        let HookEvent::Instruction(event) = event else {
            panic!("expected an instruction event");
        };
        assert_eq!(event.len(), 2);
        assert_eq!(event.next_pc(), Some(0x2000));
        assert!(event.accesses().iter().any(|a| a.kind == AccessKind::Write
            && a.location == Location::Register(Register::Rcx)));
    }

    #[test]
    fn test_translate_undecodable_and_lifecycle() {
        let (_, _, hook) = hook();
        let debuggee = Arc::new(SimulatedDebuggee::new(Architecture::X86));
        debuggee.map(0x1000, 0x1000).unwrap();
        let bridge = DebuggeeBridge::new(debuggee);

        assert!(matches!(
            hook.translate(
                DebuggerNotification::Breakpoint {
                    pc: 0x1000,
                    next_pc: None
                },
                Architecture::X86,
                &bridge
            ),
            Err(Error::Undecodable { pc: 0x1000 })
        ));
        assert!(matches!(
            hook.translate(
                DebuggerNotification::Step {
                    pc: 0x8000,
                    next_pc: None
                },
                Architecture::X86,
                &bridge
            ),
            Err(Error::InaccessibleState { .. })
        ));
        assert_eq!(
            hook.translate(
                DebuggerNotification::ProcessExit { pid: 1, code: 0 },
                Architecture::X86,
                &bridge
            )
            .unwrap(),
            HookEvent::ProcessExited { pid: 1, code: 0 }
        );
    }
}
