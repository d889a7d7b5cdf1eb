/// Integration tests for the crypto-core token service
///
/// Exercises the public API only:
/// - Pair issuance and claim round trip
/// - Isolation between independently configured services
/// - Wire shape of the claims payload
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use crypto_core::jwt::{JwtConfig, JwtError, JwtService, TokenKind, TokenSubject};
use uuid::Uuid;

fn config(tag: &str) -> JwtConfig {
    JwtConfig {
        access_secret: format!("{tag}-access-secret-0123456789abcdefghij"),
        refresh_secret: format!("{tag}-refresh-secret-0123456789abcdefghij"),
        ..JwtConfig::default()
    }
}

fn subject() -> TokenSubject {
    TokenSubject {
        user_id: Uuid::new_v4(),
        email: "officer@agency.gov".to_string(),
        role: "manager".to_string(),
        security_clearance: "top_secret".to_string(),
        permissions: vec![
            "documents:read".to_string(),
            "documents:delete".to_string(),
            "audit:write".to_string(),
        ],
    }
}

fn payload(token: &str) -> serde_json::Value {
    let body = token.split('.').nth(1).expect("token has a payload segment");
    let bytes = URL_SAFE_NO_PAD.decode(body).expect("payload is base64url");
    serde_json::from_slice(&bytes).expect("payload is JSON")
}

#[test]
fn test_claims_round_trip_through_public_api() {
    let service = JwtService::new(config("primary")).unwrap();
    let subject = subject();

    let pair = service.generate_token_pair(&subject).unwrap();
    let claims = service.validate_access_token(&pair.access_token).unwrap();

    assert_eq!(claims.user_id().unwrap(), subject.user_id);
    assert_eq!(claims.email, subject.email);
    assert_eq!(claims.security_clearance, "top_secret");
    assert_eq!(claims.permissions.len(), 3);
    assert!(claims.nbf <= claims.exp);
    assert_eq!(claims.exp - claims.iat, service.access_ttl().num_seconds());
}

#[test]
fn test_tokens_do_not_cross_service_boundaries() {
    let primary = JwtService::new(config("primary")).unwrap();
    let other = JwtService::new(config("other")).unwrap();
    let pair = primary.generate_token_pair(&subject()).unwrap();

    assert!(matches!(
        other.validate_access_token(&pair.access_token),
        Err(JwtError::Invalid(_))
    ));
    assert!(other.validate_refresh_token(&pair.refresh_token).is_err());
}

#[test]
fn test_payload_wire_shape() {
    let service = JwtService::new(config("primary")).unwrap();
    let pair = service.generate_token_pair(&subject()).unwrap();

    let access = payload(&pair.access_token);
    let refresh = payload(&pair.refresh_token);

    assert_eq!(access["token_type"], "access");
    assert_eq!(refresh["token_type"], "refresh");
    for field in ["sub", "jti", "iss", "iat", "nbf", "exp"] {
        assert!(access.get(field).is_some(), "missing {field}");
    }
}

#[test]
fn test_custom_ttls_are_honoured() {
    let service = JwtService::new(JwtConfig {
        access_ttl: Duration::minutes(5),
        refresh_ttl: Duration::hours(2),
        ..config("primary")
    })
    .unwrap();

    let before = Utc::now();
    let pair = service.generate_token_pair(&subject()).unwrap();
    let refresh = service.validate_refresh_token(&pair.refresh_token).unwrap();

    assert!(pair.expires_at <= before + Duration::minutes(5) + Duration::seconds(1));
    assert_eq!(refresh.token_type, TokenKind::Refresh);
    assert_eq!(refresh.exp - refresh.iat, Duration::hours(2).num_seconds());
}

#[test]
fn test_non_positive_ttl_rejected() {
    let result = JwtService::new(JwtConfig {
        access_ttl: Duration::zero(),
        ..config("primary")
    });
    assert!(matches!(result, Err(JwtError::Config(_))));
}
