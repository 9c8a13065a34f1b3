//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块

pub mod page;
pub mod page_desc;
pub mod bitmap;
pub mod vmtask;
pub mod anon;
pub mod hat;
pub mod rctl;
pub mod policy;
pub mod spt;

pub use page::*;
pub use page_desc::{Page, PageFlag, PageFlags, PageRef};
pub use bitmap::AtomicBitmap;
pub use vmtask::{run_job, SerialDispatcher, TaskDispatcher};
pub use anon::{AllocFail, AnonMapId, AnonStore, BackingStore, MemId};
pub use hat::{AsId, Hat, HatCap, HatLoad, HatUnload, Prot, SoftHat};
pub use rctl::{Ledger, ProjectId, ProjectLedger};
pub use policy::{MemPolicy, PolicyAdvisor, PolicyTable};
