//! Typed access to the string→string configuration maps.

use crate::error::HelperError;
use crate::helper::Params;
use std::str::FromStr;
use std::time::Duration;

pub fn required(params: &Params, key: &str) -> Result<String, HelperError> {
    params
        .get(key)
        .cloned()
        .ok_or_else(|| HelperError::invalid_argument(format!("missing required parameter `{key}`")))
}

pub fn optional(params: &Params, key: &str) -> Option<String> {
    params.get(key).cloned()
}

pub fn parsed<T>(params: &Params, key: &str) -> Result<Option<T>, HelperError>
where
    T: FromStr,
{
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            HelperError::invalid_argument(format!("parameter `{key}` has invalid value `{raw}`"))
        }),
    }
}

pub fn parsed_or<T>(params: &Params, key: &str, default: T) -> Result<T, HelperError>
where
    T: FromStr,
{
    Ok(parsed(params, key)?.unwrap_or(default))
}

/// `timeout` parameter, in milliseconds.
pub fn timeout(params: &Params, default: Duration) -> Result<Duration, HelperError> {
    Ok(parsed::<u64>(params, "timeout")?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn required_and_parsed_values() {
        let params = params(&[("uid", "1000"), ("mountPoint", "/mnt/a")]);
        assert_eq!(required(&params, "mountPoint").unwrap(), "/mnt/a");
        assert_eq!(parsed::<u32>(&params, "uid").unwrap(), Some(1000));
        assert_eq!(parsed_or::<u32>(&params, "gid", 77).unwrap(), 77);
        assert_eq!(
            required(&params, "bucketName").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn timeout_is_milliseconds() {
        let with = params(&[("timeout", "2500")]);
        assert_eq!(
            timeout(&with, Duration::from_secs(1)).unwrap(),
            Duration::from_millis(2500)
        );
        let bad = params(&[("timeout", "soon")]);
        assert!(timeout(&bad, Duration::from_secs(1)).is_err());
    }
}
