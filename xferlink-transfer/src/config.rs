use std::fmt;

use crate::{
    api::BackendInitParams,
    error::{Result, TransferError},
};

pub const BUCKET_ENV: &str = "AWS_DEFAULT_BUCKET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Typed view of the OBJ backend's custom parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_override: Option<String>,
    pub scheme: Scheme,
    pub use_virtual_addressing: bool,
    pub credentials: Option<Credentials>,
    pub num_threads: usize,
}

impl ObjConfig {
    pub fn from_params(params: &BackendInitParams) -> Result<Self> {
        Self::from_params_with_env(params, |name| std::env::var(name).ok())
    }

    /// Same as [`ObjConfig::from_params`] with an injectable environment.
    pub fn from_params_with_env(
        params: &BackendInitParams,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let bucket = params
            .param("bucket")
            .map(str::to_string)
            .or_else(|| env(BUCKET_ENV))
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| {
                TransferError::invalid(format!(
                    "bucket name not found; set the `bucket` param or {BUCKET_ENV}"
                ))
            })?;

        let scheme = match params.param("scheme") {
            None | Some("https") => Scheme::Https,
            Some("http") => Scheme::Http,
            Some(other) => {
                return Err(TransferError::invalid(format!(
                    "invalid scheme `{other}`, expected http or https"
                )));
            }
        };

        let use_virtual_addressing = match params.param("use_virtual_addressing") {
            None | Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(TransferError::invalid(format!(
                    "invalid use_virtual_addressing `{other}`, expected true or false"
                )));
            }
        };

        let credentials = match (params.param("access_key"), params.param("secret_key")) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key: access_key.to_string(),
                secret_key: secret_key.to_string(),
                session_token: params.param("session_token").map(str::to_string),
            }),
            _ => None,
        };

        let num_threads = match params.param("num_threads") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| TransferError::invalid(format!("invalid num_threads `{raw}`")))?,
            None => default_num_threads(),
        };

        Ok(Self {
            bucket,
            region: params.param("region").map(str::to_string),
            endpoint_override: params.param("endpoint_override").map(str::to_string),
            scheme,
            use_virtual_addressing,
            credentials,
            num_threads,
        })
    }
}

fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::{BUCKET_ENV, ObjConfig, Scheme};
    use crate::{api::BackendInitParams, error::TransferError};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn bucket_from_param_or_env() {
        let params = BackendInitParams::new("Agent1", "OBJ").with_param("bucket", "b1");
        let config = ObjConfig::from_params_with_env(&params, no_env).expect("config");
        assert_eq!(config.bucket, "b1");
        assert_eq!(config.scheme, Scheme::Https);
        assert!(config.use_virtual_addressing);
        assert!(config.credentials.is_none());
        assert!(config.num_threads >= 1);

        let params = BackendInitParams::new("Agent1", "OBJ");
        let config = ObjConfig::from_params_with_env(&params, |name| {
            (name == BUCKET_ENV).then(|| "env-bucket".to_string())
        })
        .expect("config");
        assert_eq!(config.bucket, "env-bucket");
    }

    #[test]
    fn missing_bucket_is_invalid() {
        let params = BackendInitParams::new("Agent1", "OBJ");
        let err = ObjConfig::from_params_with_env(&params, no_env).expect_err("must fail");
        assert!(matches!(err, TransferError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_bad_scheme_and_addressing() {
        let base = BackendInitParams::new("Agent1", "OBJ").with_param("bucket", "b1");
        assert!(
            ObjConfig::from_params_with_env(&base.clone().with_param("scheme", "ftp"), no_env)
                .is_err()
        );
        assert!(
            ObjConfig::from_params_with_env(
                &base.clone().with_param("use_virtual_addressing", "yes"),
                no_env
            )
            .is_err()
        );
        assert!(
            ObjConfig::from_params_with_env(&base.with_param("num_threads", "0"), no_env).is_err()
        );
    }

    #[test]
    fn parses_full_param_set() {
        let params = BackendInitParams::new("Agent1", "OBJ")
            .with_param("bucket", "b1")
            .with_param("region", "us-west-2")
            .with_param("endpoint_override", "localhost:9000")
            .with_param("scheme", "http")
            .with_param("use_virtual_addressing", "false")
            .with_param("access_key", "AK")
            .with_param("secret_key", "SK")
            .with_param("session_token", "ST")
            .with_param("num_threads", "3");
        let config = ObjConfig::from_params_with_env(&params, no_env).expect("config");
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.endpoint_override.as_deref(), Some("localhost:9000"));
        assert_eq!(config.scheme, Scheme::Http);
        assert!(!config.use_virtual_addressing);
        assert_eq!(config.num_threads, 3);
        let credentials = config.credentials.expect("credentials");
        assert_eq!(credentials.access_key, "AK");
        assert_eq!(credentials.session_token.as_deref(), Some("ST"));
        assert!(!format!("{credentials:?}").contains("SK"));
    }

    #[test]
    fn credentials_need_both_keys() {
        let params = BackendInitParams::new("Agent1", "OBJ")
            .with_param("bucket", "b1")
            .with_param("access_key", "AK");
        let config = ObjConfig::from_params_with_env(&params, no_env).expect("config");
        assert!(config.credentials.is_none());
    }
}
