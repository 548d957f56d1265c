//! ZigBee radio link
//!
//! - **`module`** - module commands, system answers and the module configuration
//! - **`packet`** - application packets exchanged with the coordinator
//! - **`link`** - serial link, receive path and send-and-await
//! - **`control`** - event-driven control task

pub mod control;
pub mod link;
pub mod module;
pub mod packet;

pub use control::ZbController;
pub use link::ZbLink;
pub use module::{ModuleCommand, ModuleConfig, ZbError, ZbStats};

bitflags::bitflags! {
    /// Work queued for the ZigBee control task
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ZbEvents: u32 {
        const CONFIG_CHECK = 0x0001;
        const NET_LOST = 0x0002;
        const NET_RESTORE = 0x0004;
        const SEND_STATE = 0x0010;
        const SEND_DATA = 0x0020;
        const SEND_WLOG = 0x0040;
        const SEND_VALVE = 0x0080;
        const SEND_LEAKS = 0x0100;
        const SYNC_DTIME = 0x0200;
        /// Periodic presence report
        const IM_HERE = 0x0400;
    }
}
