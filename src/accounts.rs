//! Account and position lookups.
//!
//! Thin wrappers over [`ApiClient`] so feature code does not hand-build paths
//! or flatten the brokerage's nested position records.

use crate::client::{ApiClient, ApiRequest};
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Account number paired with the hash used in account-scoped paths.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountNumber {
    pub account_number: String,
    pub hash_value: String,
}

/// Flattened position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Option<String>,
    /// Long minus short quantity
    pub quantity: f64,
    pub cost_basis: f64,
    pub market_value: f64,
    pub unrealized_pl: f64,
    pub unrealized_pl_percent: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountEnvelope {
    #[serde(default)]
    securities_account: Option<SecuritiesAccount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecuritiesAccount {
    #[serde(default)]
    account_number: Option<String>,
    #[serde(default)]
    positions: Vec<RawPosition>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawPosition {
    instrument: Option<Instrument>,
    long_quantity: f64,
    short_quantity: f64,
    average_price: f64,
    market_value: f64,
    long_open_profit_loss: f64,
    short_open_profit_loss: f64,
    current_day_profit_loss_percentage: f64,
}

#[derive(Deserialize)]
struct Instrument {
    #[serde(default)]
    symbol: Option<String>,
}

impl From<RawPosition> for Position {
    fn from(raw: RawPosition) -> Self {
        Self {
            symbol: raw.instrument.and_then(|i| i.symbol),
            quantity: raw.long_quantity - raw.short_quantity,
            cost_basis: raw.average_price * raw.long_quantity,
            market_value: raw.market_value,
            unrealized_pl: raw.long_open_profit_loss + raw.short_open_profit_loss,
            unrealized_pl_percent: raw.current_day_profit_loss_percentage,
        }
    }
}

/// `GET /trader/v1/accounts/accountNumbers`
pub async fn account_numbers(client: &ApiClient) -> Result<Vec<AccountNumber>, ApiError> {
    client
        .call_json(&ApiRequest::get("/trader/v1/accounts/accountNumbers"))
        .await
}

/// Positions for every account, keyed by account number. Accounts without
/// positions are left out.
pub async fn positions_by_account(
    client: &ApiClient,
) -> Result<BTreeMap<String, Vec<Position>>, ApiError> {
    let accounts: Vec<AccountEnvelope> = client
        .call_json(&ApiRequest::get("/trader/v1/accounts").query("fields", "positions"))
        .await?;

    Ok(accounts
        .into_iter()
        .filter_map(|envelope| envelope.securities_account)
        .filter_map(|account| {
            let number = account.account_number?;
            if account.positions.is_empty() {
                return None;
            }
            let positions = account.positions.into_iter().map(Position::from).collect();
            Some((number, positions))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_flattening() {
        let raw: RawPosition = serde_json::from_str(
            r#"{
                "instrument": {"symbol": "AAPL", "assetType": "EQUITY"},
                "longQuantity": 10.0,
                "shortQuantity": 0.0,
                "averagePrice": 150.0,
                "marketValue": 1800.0,
                "longOpenProfitLoss": 300.0,
                "shortOpenProfitLoss": 0.0,
                "currentDayProfitLossPercentage": 1.25
            }"#,
        )
        .unwrap();

        let position = Position::from(raw);
        assert_eq!(position.symbol.as_deref(), Some("AAPL"));
        assert_eq!(position.quantity, 10.0);
        assert_eq!(position.cost_basis, 1500.0);
        assert_eq!(position.unrealized_pl, 300.0);
        assert_eq!(position.unrealized_pl_percent, 1.25);
    }

    #[test]
    fn test_short_position_quantity() {
        let raw: RawPosition =
            serde_json::from_str(r#"{"longQuantity": 0, "shortQuantity": 5}"#).unwrap();
        assert_eq!(Position::from(raw).quantity, -5.0);
    }
}
