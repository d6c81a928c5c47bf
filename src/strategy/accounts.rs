use futures_util::future::join_all;

use crate::exchange::{AdapterSet, Exchange};
use crate::strategy::types::AccountSnapshot;

/// Pull account snapshots from every listed exchange concurrently.
///
/// Exchanges without an adapter, without credentials, or whose call fails are
/// skipped with a warning so the remaining accounts still produce a view.
pub async fn collect_accounts(adapters: &AdapterSet, exchanges: &[Exchange]) -> Vec<AccountSnapshot> {
    let calls = exchanges.iter().filter_map(|&exchange| match adapters.get(exchange) {
        Some(adapter) => Some(async move { (exchange, adapter.fetch_account().await) }),
        None => {
            tracing::warn!("[ENGINE] No adapter configured for {}, skipping account", exchange);
            None
        }
    });

    join_all(calls)
        .await
        .into_iter()
        .filter_map(|(exchange, result)| match result {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("[ENGINE] {} account unavailable: {}", exchange, e);
                None
            }
        })
        .collect()
}
