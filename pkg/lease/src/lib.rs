pub mod client;
pub mod clock;
pub mod error;
pub mod globalclock;
pub mod manager;
pub mod secretary;
pub mod token;

pub use client::{Client, ClientConfig, Info, Request};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LeaseError, Result};
pub use globalclock::{GlobalClockReader, GlobalClockUpdater, GlobalClockWorker};
pub use manager::{Checker, Claimer, Manager, ManagerConfig, NamespaceConfig, Token};
pub use secretary::{IdentitySecretary, Secretary};
pub use token::FencingAssertion;
