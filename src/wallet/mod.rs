pub mod account;
pub mod checkpoint;
pub mod deriver;
pub mod sync;
pub mod types;

pub use account::{AccountState, Reconciled};
pub use checkpoint::{FileWalletCheckpoint, WalletCheckpoint};
pub use deriver::{AddressDeriver, XpubAddressDeriver};
pub use sync::{
	ChannelEventHandler, EventDispatcher, LoggingEventHandler, SyncEvent, SyncEventHandler,
	SyncStats, WalletSyncOrchestrator,
};
pub use types::*;
