//! FIFO cost-basis lot consumption.
//!
//! Lots are ordered oldest-acquired first; a sale consumes the prefix
//! totaling the sale amount, partially decrementing the last touched lot.

/// A consumable lot view (already ordered by acquisition time).
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub id: i64,
    pub remaining: f64,
    pub cost_per_token: f64,
}

/// Post-consumption state for one touched lot; `remaining` of zero means
/// the lot is fully consumed and should be removed.
#[derive(Debug, Clone, PartialEq)]
pub struct LotUpdate {
    pub id: i64,
    pub remaining: f64,
}

/// Result of consuming lots against a sale.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumption {
    pub consumed_cost: f64,
    pub consumed_amount: f64,
    pub updates: Vec<LotUpdate>,
}

/// Consume `amount` tokens FIFO from `lots`. When the lots cannot cover the
/// full amount, everything available is consumed and the shortfall carries a
/// zero basis (the sale of untracked inventory).
pub fn consume_fifo(lots: &[Lot], amount: f64) -> Consumption {
    let mut needed = amount.max(0.0);
    let mut consumed_cost = 0.0;
    let mut consumed_amount = 0.0;
    let mut updates = Vec::new();

    for lot in lots {
        if needed <= 0.0 {
            break;
        }
        let take = needed.min(lot.remaining);
        if take <= 0.0 {
            continue;
        }
        consumed_cost += take * lot.cost_per_token;
        consumed_amount += take;
        needed -= take;
        updates.push(LotUpdate {
            id: lot.id,
            remaining: lot.remaining - take,
        });
    }

    Consumption {
        consumed_cost,
        consumed_amount,
        updates,
    }
}
