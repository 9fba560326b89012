//! aqm-policy
//!
//! Stateless mapping from a device's current conditions to a desired key
//! tier (§4.5). The caller then hands the result to
//! `Inventory::select_coin`, which honors the downward fallback chain if
//! the desired tier's cache is empty.

use aqm_core::Tier;

/// Snapshot of a sending device's conditions at the moment of dispatch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceContext {
    /// Battery level, 0-100.
    pub battery_pct: u8,
    pub has_wifi: bool,
    /// Signal strength in dBm; more negative is weaker.
    pub signal_dbm: i32,
}

/// Evaluates the decision table top-down; first match wins.
pub fn desired_tier(ctx: DeviceContext) -> Tier {
    if ctx.battery_pct < 5 {
        return Tier::Bronze;
    }
    if !ctx.has_wifi && ctx.signal_dbm < -100 {
        return Tier::Bronze;
    }
    if ctx.has_wifi && ctx.battery_pct < 20 {
        return Tier::Bronze;
    }
    if !ctx.has_wifi && ctx.signal_dbm >= -100 {
        return Tier::Silver;
    }
    if ctx.has_wifi && ctx.battery_pct < 50 {
        return Tier::Silver;
    }
    // has_wifi && battery_pct >= 50
    Tier::Gold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(battery_pct: u8, has_wifi: bool, signal_dbm: i32) -> DeviceContext {
        DeviceContext {
            battery_pct,
            has_wifi,
            signal_dbm,
        }
    }

    #[test]
    fn critical_battery_always_bronze_regardless_of_connectivity() {
        assert_eq!(desired_tier(ctx(4, true, -50)), Tier::Bronze);
        assert_eq!(desired_tier(ctx(4, false, -150)), Tier::Bronze);
    }

    #[test]
    fn weak_cellular_signal_is_bronze() {
        assert_eq!(desired_tier(ctx(80, false, -110)), Tier::Bronze);
    }

    #[test]
    fn wifi_with_low_battery_is_bronze_not_silver() {
        assert_eq!(desired_tier(ctx(15, true, -40)), Tier::Bronze);
    }

    #[test]
    fn decent_cellular_is_silver() {
        assert_eq!(desired_tier(ctx(80, false, -90)), Tier::Silver);
    }

    #[test]
    fn wifi_mid_battery_is_silver() {
        assert_eq!(desired_tier(ctx(35, true, -40)), Tier::Silver);
    }

    #[test]
    fn wifi_full_battery_is_gold() {
        assert_eq!(desired_tier(ctx(90, true, -40)), Tier::Gold);
    }

    #[test]
    fn boundary_at_exactly_50_percent_is_gold() {
        assert_eq!(desired_tier(ctx(50, true, -40)), Tier::Gold);
    }

    #[test]
    fn boundary_at_exactly_20_percent_is_silver_not_bronze() {
        assert_eq!(desired_tier(ctx(20, true, -40)), Tier::Silver);
    }

    #[test]
    fn boundary_at_exactly_minus_100_dbm_is_silver_not_bronze() {
        assert_eq!(desired_tier(ctx(80, false, -100)), Tier::Silver);
    }
}
