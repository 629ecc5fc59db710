pub mod packet;
pub use packet::*;

pub mod open;
pub use open::*;

pub mod notification;
pub use notification::*;

pub mod refresh;
pub use refresh::*;

pub mod update;
pub use update::*;

pub mod caps;
pub use caps::*;

pub mod afi;
pub use afi::*;

pub mod nlri;
pub use nlri::*;

pub mod attr;
pub use attr::*;

pub mod mrt;
pub use mrt::*;

pub mod error;
pub use error::*;
