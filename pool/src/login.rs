/// Worker login parsing
///
/// Miners log in as `ADDRESS.PAYMENT-ID.WORKER/PASSWORD` where ADDRESS is a PASA
/// account number with an optional `-NN` checksum. The normalized
/// `address.payment_id` pair is the identity balances are keyed by.

use thiserror::Error;

use crate::config::KnownAccount;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("invalid login format")]
    Format,
    #[error("pasa is not valid")]
    InvalidPasa,
    #[error("payment_id required when mining to {0}")]
    PaymentIdRequired(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLogin {
    /// `account-checksum`
    pub address: String,
    pub payment_id: String,
    pub worker_id: String,
    pub password: String,
    /// Name of the exchange when mining to a known account
    pub known_account: Option<String>,
}

impl WorkerLogin {
    /// Balance key: `address.payment_id`
    pub fn address_pid(&self) -> String {
        format!("{}.{}", self.address, self.payment_id)
    }

    /// PASA account number without the checksum
    pub fn account(&self) -> &str {
        self.address.split('-').next().unwrap_or(&self.address)
    }
}

pub fn pasa_checksum(account: u64) -> u64 {
    ((account % 89) * 101 % 89) + 10
}

/// Formats an account number as `account-checksum`.
pub fn pasa_address(account: u64) -> String {
    format!("{}-{}", account, pasa_checksum(account))
}

fn normalize_pasa(address: &str) -> Option<String> {
    if address.is_empty() || !address.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return None;
    }
    let mut parts = address.split('-');
    let account: u64 = parts.next()?.parse().ok()?;
    match (parts.next(), parts.next()) {
        (None, _) => Some(pasa_address(account)),
        (Some(sum), None) => {
            let sum: u64 = sum.parse().ok()?;
            (sum == pasa_checksum(account)).then(|| address.to_string())
        }
        _ => None,
    }
}

pub fn validate_login(login: &str, known_accounts: &[KnownAccount]) -> Result<WorkerLogin, LoginError> {
    let mut halves = login.split('/');
    let credentials = halves.next().unwrap_or_default();
    let mut password = halves.next().unwrap_or_default().to_string();
    if halves.next().is_some() {
        return Err(LoginError::Format);
    }

    let mut parts: Vec<&str> = credentials.split('.').collect();
    let (address, mut payment_id, worker_id) = match parts.len() {
        0 => return Err(LoginError::Format),
        1 => (parts[0], "0", "unnamed".to_string()),
        2 => (parts[0], parts[1], "unnamed".to_string()),
        _ => {
            let address = parts.remove(0);
            let payment_id = parts.remove(0);
            // nanominer repeats the payment id (or leaves an empty segment) before the worker
            if parts.len() >= 2 && (parts[0] == payment_id || parts[0].is_empty()) {
                parts.remove(0);
            }
            (address, payment_id, parts.join("."))
        }
    };

    let rig_suffix = format!(".{}", worker_id);
    if password.ends_with(&rig_suffix) {
        password.truncate(password.len() - rig_suffix.len());
    }

    let address = normalize_pasa(address).ok_or(LoginError::InvalidPasa)?;
    if payment_id.is_empty() {
        payment_id = "0";
    }

    let mut known_account = None;
    for known in known_accounts {
        if normalize_pasa(&known.account).as_deref() == Some(address.as_str()) {
            if payment_id == "0" {
                return Err(LoginError::PaymentIdRequired(known.name.clone()));
            }
            known_account = Some(known.name.clone());
        }
    }

    Ok(WorkerLogin {
        address,
        payment_id: payment_id.to_string(),
        worker_id,
        password,
        known_account,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_appended() {
        let login = validate_login("1234", &[]).unwrap();
        assert_eq!(login.address, format!("1234-{}", pasa_checksum(1234)));
        assert_eq!(login.payment_id, "0");
        assert_eq!(login.worker_id, "unnamed");
        assert_eq!(login.address_pid(), format!("{}.0", login.address));
        assert_eq!(login.account(), "1234");
    }

    #[test]
    fn test_checksum_values() {
        assert_eq!(pasa_checksum(0), 10);
        assert_eq!(pasa_checksum(1), 22);
        assert_eq!(pasa_address(1309452), format!("1309452-{}", ((1309452u64 * 101) % 89) + 10));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let good = pasa_checksum(77);
        let bad = if good == 10 { 11 } else { good - 1 };
        assert_eq!(validate_login(&format!("77-{}", bad), &[]), Err(LoginError::InvalidPasa));
        assert_eq!(validate_login("abc", &[]), Err(LoginError::InvalidPasa));
        assert_eq!(validate_login("1-2-3", &[]), Err(LoginError::InvalidPasa));
    }

    #[test]
    fn test_full_login() {
        let login = validate_login("77.cafe.rig1.gpu/secret.rig1.gpu", &[]).unwrap();
        assert_eq!(login.payment_id, "cafe");
        assert_eq!(login.worker_id, "rig1.gpu");
        assert_eq!(login.password, "secret");
    }

    #[test]
    fn test_repeated_payment_id_skipped() {
        let login = validate_login("77.cafe.cafe.rig1", &[]).unwrap();
        assert_eq!(login.worker_id, "rig1");

        let login = validate_login("77..rig1", &[]).unwrap();
        assert_eq!(login.payment_id, "0");
        assert_eq!(login.worker_id, "rig1");
    }

    #[test]
    fn test_large_account_checksum() {
        for account in [200_000_000_000_000_000u64, u64::MAX / 101 + 1, u64::MAX] {
            let expected = ((account as u128 * 101) % 89) as u64 + 10;
            assert_eq!(pasa_checksum(account), expected);
        }

        let login = validate_login("200000000000000000.0.rig", &[]).unwrap();
        assert_eq!(login.address, pasa_address(200_000_000_000_000_000));
        assert_eq!(login.worker_id, "rig");
    }

    #[test]
    fn test_too_many_slashes() {
        assert_eq!(validate_login("77/a/b", &[]), Err(LoginError::Format));
    }

    #[test]
    fn test_known_account_requires_payment_id() {
        let known = vec![KnownAccount { account: pasa_address(500), name: "exchange".to_string() }];
        assert_eq!(
            validate_login("500", &known),
            Err(LoginError::PaymentIdRequired("exchange".to_string()))
        );
        let login = validate_login("500.42", &known).unwrap();
        assert_eq!(login.known_account.as_deref(), Some("exchange"));

        let bare = vec![KnownAccount { account: "500".to_string(), name: "exchange".to_string() }];
        assert!(validate_login("500", &bare).is_err());
    }
}
