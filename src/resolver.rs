//! Symbol resolution and history retrieval.
//!
//! Historical requests are always two-step: resolve the symbolic contract
//! description to full contract details first, then query history against
//! the resolved numeric contract id. Querying by description directly is
//! ambiguous for continuous futures; the conId is not.

use std::time::Duration;

use ibgate_tws::{Bar, Contract, ContractDetails};

use crate::error::GatewayError;
use crate::products;
use crate::session::Session;

pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(15);
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a history fetch. Both "no such contract" and "contract exists
/// but has no bars" are results rather than errors; the HTTP layer decides
/// their status codes.
#[derive(Debug)]
pub enum HistoryOutcome {
    NoContract,
    NoBars(Box<ContractDetails>),
    Bars {
        details: Box<ContractDetails>,
        bars: Vec<Bar>,
    },
}

/// Resolve a fully specified contract description against the broker.
pub async fn resolve_contract(
    session: &Session,
    contract: &Contract,
) -> Result<Vec<ContractDetails>, GatewayError> {
    tracing::debug!(
        broker_symbol = %contract.symbol,
        sec_type = %contract.sec_type,
        exchange = %contract.exchange,
        "resolving contract"
    );
    session.contract_details(contract, RESOLVE_TIMEOUT).await
}

/// Resolve a request symbol into the broker's matching contract details.
pub async fn resolve(
    session: &Session,
    symbol: &str,
) -> Result<Vec<ContractDetails>, GatewayError> {
    let contract = products::contract_for_symbol(symbol);
    resolve_contract(session, &contract).await
}

/// Re-key a resolved contract by its numeric id for the history request.
///
/// CONTFUT resolves to a concrete front-month future, so the follow-up
/// query goes out as FUT against the resolved conId and venue.
fn query_contract(details: &ContractDetails) -> Contract {
    let resolved = &details.contract;
    Contract {
        con_id: resolved.con_id,
        symbol: resolved.symbol.clone(),
        sec_type: if resolved.sec_type == "CONTFUT" {
            "FUT".to_string()
        } else {
            resolved.sec_type.clone()
        },
        exchange: resolved.exchange.clone(),
        currency: resolved.currency.clone(),
        ..Default::default()
    }
}

/// Resolve a symbol and fetch its historical bars.
///
/// The first resolved match wins when the broker returns several. Bars are
/// requested up to now (`end_date_time` empty) over all trading hours.
pub async fn fetch_history(
    session: &Session,
    symbol: &str,
    duration: &str,
    bar_size: &str,
    what_to_show: &str,
) -> Result<HistoryOutcome, GatewayError> {
    let mut matches = resolve(session, symbol).await?;
    if matches.is_empty() {
        return Ok(HistoryOutcome::NoContract);
    }
    let details = Box::new(matches.remove(0));

    let contract = query_contract(&details);
    tracing::info!(
        symbol,
        con_id = contract.con_id,
        local_symbol = %details.contract.local_symbol,
        duration,
        bar_size,
        what_to_show,
        "fetching history"
    );

    let bars = session
        .historical_data(
            &contract,
            "",
            duration,
            bar_size,
            what_to_show,
            false,
            HISTORY_TIMEOUT,
        )
        .await?;

    if bars.is_empty() {
        Ok(HistoryOutcome::NoBars(details))
    } else {
        Ok(HistoryOutcome::Bars { details, bars })
    }
}
