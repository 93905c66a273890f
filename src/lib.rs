//! A cycle-accurate simulator for a pair of 16-bit teaching ISAs.
//!
//! Both instruction sets share one machine model: a 2^16-word address space,
//! eight general-purpose registers, a program counter, a processor status
//! word with supervisor/user modes and NZP condition codes, memory-mapped
//! keyboard and display devices, and vectored traps, exceptions, and
//! interrupts with a supervisor-stack switch. They differ in everything
//! per-instruction; the [`isa::IsaKind`] chosen at construction selects
//! which decoder and executor a machine runs.
//!
//! The crate splits into three layers:
//!
//! - [`obj`]: object images and source maps, the input format. There is no
//!   assembler here; images come from an external toolchain.
//! - [`sim`]: the machine state and the execution engine, with
//!   debugger-grade run control (run, step-in, step-out, step-over,
//!   breakpoints, cooperative cancellation).
//! - [`worker`]: the engine on its own thread, driven over channels, with
//!   the machine state shared losslessly through atomics.
//!
//! # Usage
//!
//! Create a [`sim::Simulator`], load an [`obj::ObjImage`], and drive it:
//!
//! ```
//! use duet16::isa::reg_consts::R0;
//! use duet16::isa::IsaKind;
//! use duet16::obj::ObjImage;
//! use duet16::sim::{Simulator, StopReason};
//!
//! let mut sim = Simulator::new(IsaKind::Lc);
//! // AND R0, R0, #0 ; ADD R0, R0, #1 ; ADD R0, R0, #1
//! sim.load_obj(&ObjImage::new(0x3000, vec![0x5020, 0x1021, 0x1021]));
//!
//! sim.breakpoints.insert(0x3002);
//! assert_eq!(sim.run(), StopReason::Breakpoint);
//! assert_eq!(sim.reg(R0), 1);
//!
//! assert_eq!(sim.step_in(), StopReason::StepDone);
//! assert_eq!(sim.reg(R0), 2);
//! ```
//!
//! For interactive front ends, [`worker::SimHandle`] runs the same engine
//! on a background thread. Commands go down a channel, console output and
//! completion notifications come back up another, and the machine state
//! itself stays readable the whole time:
//!
//! ```
//! use duet16::isa::IsaKind;
//! use duet16::obj::ObjImage;
//! use duet16::worker::{Command, Notification, SimHandle};
//!
//! let handle = SimHandle::spawn(IsaKind::Lc);
//! handle
//!     .send(Command::LoadObj(ObjImage::new(0x3000, vec![0x5020, 0x1021])))
//!     .unwrap();
//! handle.send(Command::StepIn).unwrap();
//!
//! while let Ok(note) = handle.notifications().recv() {
//!     if let Notification::Done(reason) = note {
//!         println!("stopped: {reason}");
//!         break;
//!     }
//! }
//! assert_eq!(handle.machine().pc.get(), 0x3001);
//! handle.shutdown();
//! ```

#![warn(missing_docs)]

pub mod isa;
pub mod obj;
pub mod sim;
pub mod worker;
