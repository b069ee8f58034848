// SPDX-License-Identifier: Apache-2.0

//! Redaction for secrets that flow through `tracing` fields.
//!
//! Logon passwords and key-store passwords are carried as [`Sensitive`].
//! Formatting never shows the value. Serialization does, because logon
//! credentials are part of the wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

const REDACTED: &str = "[REDACTED]";

#[derive(Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Credentials;

    #[test]
    fn credentials_never_print_the_password() {
        let credentials = Credentials::new("alice", "hunter2", "sales");
        let printed = format!("{credentials:?} {}", credentials.password);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains(REDACTED));
        assert_eq!(credentials.password.expose(), "hunter2");
    }

    #[test]
    fn store_password_crosses_the_wire_intact() {
        let password = Some(Sensitive::new("changeit".to_string()));
        let bytes = rmp_serde::to_vec(&password).unwrap();
        let decoded: Option<Sensitive<String>> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, password);
        assert_eq!(decoded.map(Sensitive::into_inner).as_deref(), Some("changeit"));
    }
}
