//! Persistence for option-chain snapshots. Rows are keyed on
//! `(timestamp, strike, option_type, expiry_date)`, so a repeated snapshot
//! inside one time bucket overwrites instead of duplicating.

use crate::error::SinkError;
use crate::model::OptionSnapshot;

use super::WriteReport;

pub trait OptionChainSink {
    fn chain_target(&self, table: &str) -> String;

    fn write_snapshots(
        &mut self,
        table: &str,
        snapshots: &[OptionSnapshot],
    ) -> Result<WriteReport, SinkError>;
}

impl<S: OptionChainSink + ?Sized> OptionChainSink for Box<S> {
    fn chain_target(&self, table: &str) -> String {
        (**self).chain_target(table)
    }

    fn write_snapshots(
        &mut self,
        table: &str,
        snapshots: &[OptionSnapshot],
    ) -> Result<WriteReport, SinkError> {
        (**self).write_snapshots(table, snapshots)
    }
}
