//! Broker Position Query
//!
//! Point-in-time read of the quantity held for one instrument. The broker's
//! live position list is queried on every call; no local position table is
//! kept, so fills the process did not initiate are always reflected.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::ports::{BrokerError, BrokerPort, bounded};
use crate::domain::instrument::Instrument;

/// Current signed quantity held for `instrument`.
///
/// An instrument absent from the position list is flat; that is not an
/// error.
///
/// # Errors
///
/// Returns the broker error if the position list cannot be read within
/// `timeout`.
pub async fn query_position(
    broker: &dyn BrokerPort,
    instrument: &Instrument,
    timeout: Duration,
) -> Result<Decimal, BrokerError> {
    let positions = bounded("positions", timeout, broker.positions()).await?;

    Ok(positions
        .iter()
        .find(|p| p.contract_id == instrument.contract_id())
        .map_or(Decimal::ZERO, |p| p.quantity))
}
