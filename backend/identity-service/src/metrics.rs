/// Prometheus metrics for the identity core
///
/// Registered in the default registry on first use.
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

static LOGIN_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "identity_login_attempts_total",
        "Authentication attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register login attempts metric")
});

static TOKEN_REFRESHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "identity_token_refresh_total",
        "Token refresh attempts by outcome",
        &["outcome"]
    )
    .expect("Failed to register token refresh metric")
});

static AUTHZ_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "identity_authz_decisions_total",
        "Access gate decisions",
        &["decision"]
    )
    .expect("Failed to register authorization decisions metric")
});

pub fn record_login(outcome: &str) {
    LOGIN_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_refresh(outcome: &str) {
    TOKEN_REFRESHES.with_label_values(&[outcome]).inc();
}

pub fn record_authz_decision(decision: &str) {
    AUTHZ_DECISIONS.with_label_values(&[decision]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = LOGIN_ATTEMPTS.with_label_values(&["metrics_test"]).get();
        record_login("metrics_test");
        record_login("metrics_test");
        assert_eq!(
            LOGIN_ATTEMPTS.with_label_values(&["metrics_test"]).get(),
            before + 2
        );

        record_refresh("metrics_test");
        record_authz_decision("metrics_test");
        assert!(TOKEN_REFRESHES.with_label_values(&["metrics_test"]).get() >= 1);
        assert!(AUTHZ_DECISIONS.with_label_values(&["metrics_test"]).get() >= 1);
    }
}
