//! Amazon Resource Name parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

const PARTITIONS: &[&str] = &["aws", "aws-cn", "aws-us-gov"];

/// A parsed ARN: `arn:<partition>:<service>:<region>:<account_id>:<resource_type><sep><resource>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsArn {
    pub partition: String,
    pub service: String,
    pub region: Option<String>,
    pub account_id: String,
    pub resource_type: String,
    pub resource_separator: Option<char>,
    pub resource: Option<String>,
    raw: String,
}

impl AwsArn {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| AppError::Validation(format!("Invalid ARN '{}': {}", input, reason));

        let input = input.trim();
        let mut parts = input.splitn(6, ':');
        let (prefix, partition, service, region, account_id, rest) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f)) => (a, b, c, d, e, f),
            _ => return Err(invalid("expected six colon-separated fields")),
        };

        if prefix != "arn" {
            return Err(invalid("must start with 'arn:'"));
        }
        if !PARTITIONS.contains(&partition) {
            return Err(invalid("unknown partition"));
        }
        if service.is_empty()
            || !service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid("invalid service"));
        }
        if !region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("invalid region"));
        }
        if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("account id must be 12 digits"));
        }

        let (resource_type, resource_separator, resource) =
            match rest.find(|c| c == '/' || c == ':') {
                Some(idx) => (
                    &rest[..idx],
                    rest[idx..].chars().next(),
                    Some(rest[idx + 1..].to_string()),
                ),
                None => (rest, None, None),
            };
        if resource_type.is_empty() {
            return Err(invalid("missing resource type"));
        }
        if resource.as_deref() == Some("") {
            return Err(invalid("empty resource"));
        }

        Ok(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: (!region.is_empty()).then(|| region.to_string()),
            account_id: account_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_separator,
            resource,
            raw: input.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for AwsArn {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        AwsArn::parse(s)
    }
}

impl fmt::Display for AwsArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role_arn() {
        let arn = AwsArn::parse("arn:aws:iam::123456789012:role/cloudigrade-role").unwrap();
        assert_eq!(arn.partition, "aws");
        assert_eq!(arn.service, "iam");
        assert_eq!(arn.region, None);
        assert_eq!(arn.account_id, "123456789012");
        assert_eq!(arn.resource_type, "role");
        assert_eq!(arn.resource_separator, Some('/'));
        assert_eq!(arn.resource.as_deref(), Some("cloudigrade-role"));
        assert_eq!(arn.to_string(), "arn:aws:iam::123456789012:role/cloudigrade-role");
    }

    #[test]
    fn test_parse_colon_separator_and_nested_resource() {
        let arn = AwsArn::parse(
            "arn:aws-us-gov:logs:us-gov-west-1:123456789012:log-group:/aws/lambda:*",
        )
        .unwrap();
        assert_eq!(arn.region.as_deref(), Some("us-gov-west-1"));
        assert_eq!(arn.resource_type, "log-group");
        assert_eq!(arn.resource_separator, Some(':'));
        assert_eq!(arn.resource.as_deref(), Some("/aws/lambda:*"));
    }

    #[test]
    fn test_parse_resource_without_separator() {
        let arn = AwsArn::parse("arn:aws:sns:us-east-1:123456789012:my-topic").unwrap();
        assert_eq!(arn.resource_type, "my-topic");
        assert_eq!(arn.resource, None);
    }

    #[test]
    fn test_rejects_malformed_arns() {
        for bad in [
            "",
            "not-an-arn",
            "arn:aws:iam::123456789012",
            "nra:aws:iam::123456789012:role/foo",
            "arn:azure:iam::123456789012:role/foo",
            "arn:aws:iam::1234:role/foo",
            "arn:aws:iam::12345678901a:role/foo",
            "arn:aws::us-east-1:123456789012:role/foo",
            "arn:aws:iam::123456789012:",
            "arn:aws:iam::123456789012:role/",
        ] {
            let err = AwsArn::parse(bad).unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{} should be rejected", bad);
        }
    }
}
