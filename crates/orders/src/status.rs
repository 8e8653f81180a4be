//! Order status derived from fulfilled and returned quantities.

use serde::{Deserialize, Serialize};

use crate::fulfillment::ReturnKind;
use crate::order::{OrderLine, OrderStatus};

/// Returned and replaced quantity gathered from an order's fulfillments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReturnTally {
    pub returned: i64,
    pub replaced: i64,
}

impl ReturnTally {
    pub fn add(&mut self, kind: ReturnKind, quantity: i32) {
        match kind {
            ReturnKind::Returned => self.returned += i64::from(quantity),
            ReturnKind::Replaced => self.replaced += i64::from(quantity),
        }
    }

    pub fn merge(&mut self, other: ReturnTally) {
        self.returned += other.returned;
        self.replaced += other.replaced;
    }
}

/// `(total, fulfilled, returned)` quantities of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FulfillmentTotals {
    pub total: i64,
    pub fulfilled: i64,
    pub returned: i64,
}

impl FulfillmentTotals {
    /// Ordered and fulfilled quantity summed over `lines`.
    pub fn from_lines(lines: &[OrderLine]) -> Self {
        lines.iter().fold(Self::default(), |acc, line| Self {
            total: acc.total + i64::from(line.quantity),
            fulfilled: acc.fulfilled + i64::from(line.quantity_fulfilled),
            returned: acc.returned,
        })
    }

    /// Fold returns in; replaced quantity leaves both total and fulfilled.
    pub fn including_returns(self, tally: ReturnTally) -> Self {
        Self {
            total: self.total - tally.replaced,
            fulfilled: self.fulfilled - tally.replaced,
            returned: self.returned + tally.returned,
        }
    }
}

/// Status an order should have given its totals.
///
/// `current` is kept when nothing is left to account for (everything was
/// replaced).
pub fn resolve_order_status(
    current: OrderStatus,
    totals: FulfillmentTotals,
    awaiting_approval: bool,
) -> OrderStatus {
    let FulfillmentTotals {
        total,
        fulfilled,
        returned,
    } = totals;

    if total == 0 {
        current
    } else if fulfilled <= 0 || awaiting_approval {
        OrderStatus::Unfulfilled
    } else if 0 < returned && returned < total {
        OrderStatus::PartiallyReturned
    } else if returned == total {
        OrderStatus::Returned
    } else if fulfilled < total {
        OrderStatus::PartiallyFulfilled
    } else {
        OrderStatus::Fulfilled
    }
}
