//! HD address derivation seam.

use super::types::{Chain, WalletSyncError};

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, Network, NetworkKind};
use std::str::FromStr;

/// Produces the addresses the sync engine scans.
pub trait AddressDeriver: Send + Sync {
	fn derive_receive_address(&self, account: u32, index: u32) -> Result<Address, WalletSyncError>;

	fn derive_change_address(&self, account: u32, index: u32) -> Result<Address, WalletSyncError>;

	fn extended_public_key(&self, account: u32) -> Result<String, WalletSyncError>;

	fn derive_address(
		&self,
		account: u32,
		chain: Chain,
		index: u32,
	) -> Result<Address, WalletSyncError> {
		match chain {
			Chain::External => self.derive_receive_address(account, index),
			Chain::Internal => self.derive_change_address(account, index),
		}
	}
}

/// Watch-only deriver: unhardened `<chain>/<index>` below account-level xpubs, P2WPKH addresses.
pub struct XpubAddressDeriver {
	network: Network,
	accounts: Vec<Xpub>,
	secp: Secp256k1<VerifyOnly>,
}

impl XpubAddressDeriver {
	/// # Arguments
	/// * `network` - Network the addresses are encoded for; every key must belong to it.
	/// * `xpubs` - Account-level extended public keys, indexed by account number.
	pub fn new(network: Network, xpubs: &[String]) -> Result<Self, WalletSyncError> {
		let accounts = xpubs
			.iter()
			.map(|encoded| {
				let xpub = Xpub::from_str(encoded)
					.map_err(|e| WalletSyncError::Derivation(format!("Invalid xpub: {e}")))?;
				if xpub.network != NetworkKind::from(network) {
					return Err(WalletSyncError::Derivation(format!(
						"Extended key is not for {network}"
					)));
				}
				Ok(xpub)
			})
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self {
			network,
			accounts,
			secp: Secp256k1::verification_only(),
		})
	}

	pub fn account_count(&self) -> usize {
		self.accounts.len()
	}

	fn account(&self, account: u32) -> Result<&Xpub, WalletSyncError> {
		self.accounts
			.get(account as usize)
			.ok_or_else(|| WalletSyncError::Derivation(format!("Unknown account {account}")))
	}

	fn derive(&self, account: u32, chain: Chain, index: u32) -> Result<Address, WalletSyncError> {
		let path = [
			ChildNumber::from_normal_idx(chain.child_index())
				.map_err(|e| WalletSyncError::Derivation(e.to_string()))?,
			ChildNumber::from_normal_idx(index)
				.map_err(|e| WalletSyncError::Derivation(e.to_string()))?,
		];
		let child = self
			.account(account)?
			.derive_pub(&self.secp, &path)
			.map_err(|e| WalletSyncError::Derivation(e.to_string()))?;
		Ok(Address::p2wpkh(&child.to_pub(), self.network))
	}
}

impl AddressDeriver for XpubAddressDeriver {
	fn derive_receive_address(&self, account: u32, index: u32) -> Result<Address, WalletSyncError> {
		self.derive(account, Chain::External, index)
	}

	fn derive_change_address(&self, account: u32, index: u32) -> Result<Address, WalletSyncError> {
		self.derive(account, Chain::Internal, index)
	}

	fn extended_public_key(&self, account: u32) -> Result<String, WalletSyncError> {
		Ok(self.account(account)?.to_string())
	}
}
