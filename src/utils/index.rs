/// Number of decimal places for one bitcoin.
pub const BTC_DECIMALS: u32 = 8;

/// Formats a satoshi amount as a BTC string with all eight decimals, e.g. `0.00012000`.
pub fn format_btc_amount(amount_sats: u64) -> String {
	let unit = 10u64.pow(BTC_DECIMALS);
	format!(
		"{}.{:0width$}",
		amount_sats / unit,
		amount_sats % unit,
		width = BTC_DECIMALS as usize
	)
}

/// Converts an Electrum fee rate in BTC/kB to sat/vB.
pub fn btc_per_kb_to_sat_per_vb(rate: f64) -> f64 {
	rate * 10f64.powi(BTC_DECIMALS as i32) / 1000.0
}
