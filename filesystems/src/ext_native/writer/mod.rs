// Operations that change the on-disk image

pub mod closefs;
pub mod inline_data;
pub mod newdir;
pub mod relocation;
pub mod res_gdt;

pub use closefs::{group_has_super, BackupGroups, SuperAndBgdLoc};
pub use relocation::{Relocation, RelocationTable};
