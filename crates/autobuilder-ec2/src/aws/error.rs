//! AWS error classification and handling
//!
//! Provides typed errors for AWS SDK operations using the `.code()` method
//! instead of string matching on Debug format.

use thiserror::Error;

/// AWS error categories for retry and teardown logic
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource was not found (teardown treats this as already done)
    #[error("Resource not found: {resource_id}")]
    NotFound { resource_id: String },

    /// IAM profile not yet visible to EC2 (eventual consistency, retryable)
    #[error("IAM profile not yet visible to EC2 (eventual consistency)")]
    IamPropagationDelay,

    /// Rate limit exceeded (retryable with backoff)
    #[error("Rate limit exceeded")]
    Throttled,

    /// No capacity for the requested type/zone
    #[error("Insufficient capacity: {message}")]
    InsufficientCapacity { message: String },

    /// Generic AWS SDK error with code and message
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, AwsError::IamPropagationDelay | AwsError::Throttled)
    }

    /// Check if this is a capacity error
    pub fn is_capacity(&self) -> bool {
        matches!(self, AwsError::InsufficientCapacity { .. })
    }

    /// Get a user-friendly suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            AwsError::Sdk { code: Some(c), .. } => suggestion_for_code(c),
            AwsError::InsufficientCapacity { .. } => {
                suggestion_for_code("InsufficientInstanceCapacity")
            }
            AwsError::Throttled => suggestion_for_code("RequestLimitExceeded"),
            _ => None,
        }
    }
}

/// Known AWS error codes for "not found" conditions
const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidAllocationID.NotFound",
    "InvalidAssociationID.NotFound",
    "InvalidAddress.NotFound",
    "InvalidSpotInstanceRequestID.NotFound",
    "InvalidSubnetID.NotFound",
];

/// Known AWS error codes for throttling/rate limiting
const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

/// Known AWS error codes for capacity shortfalls
const CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientHostCapacity",
    "InsufficientCapacity",
    "MaxSpotInstanceCountExceeded",
];

/// Classify an AWS SDK error using the error code.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound {
            resource_id: message,
        },
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        Some(c) if CAPACITY_CODES.contains(&c) => AwsError::InsufficientCapacity { message },
        Some("InvalidParameterValue") if message.contains("iamInstanceProfile") => {
            AwsError::IamPropagationDelay
        }
        Some(_) if message.contains("Invalid IAM Instance Profile") => {
            AwsError::IamPropagationDelay
        }
        _ => AwsError::Sdk {
            code: code.map(|s| s.to_string()),
            message,
        },
    }
}

/// Classify an error from an anyhow::Error by extracting the AWS error code.
///
/// Walks the error chain looking for the SDK errors of the EC2 operations the
/// engine issues and reads `.code()`/`.message()` from their metadata. Falls
/// back to string matching on the Debug representation if no typed error is
/// found.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
    use aws_sdk_ec2::operation::{
        associate_address::AssociateAddressError,
        cancel_spot_instance_requests::CancelSpotInstanceRequestsError,
        describe_instances::DescribeInstancesError,
        describe_spot_instance_requests::DescribeSpotInstanceRequestsError,
        disassociate_address::DisassociateAddressError, request_spot_instances::RequestSpotInstancesError,
        run_instances::RunInstancesError, terminate_instances::TerminateInstancesError,
    };

    macro_rules! try_classify {
        ($cause:expr, $($ty:ty),+ $(,)?) => {
            $(
                if let Some(e) = $cause.downcast_ref::<SdkError<$ty>>() {
                    let meta = ProvideErrorMetadata::meta(e);
                    return classify_aws_error(meta.code(), meta.message());
                }
            )+
        };
    }

    for cause in error.chain() {
        try_classify!(
            cause,
            RunInstancesError,
            DescribeInstancesError,
            TerminateInstancesError,
            RequestSpotInstancesError,
            DescribeSpotInstanceRequestsError,
            CancelSpotInstanceRequestsError,
            AssociateAddressError,
            DisassociateAddressError,
        );
    }

    // Fallback: extract error code from debug string representation
    let debug_str = format!("{:?}", error);
    if let Some(code) = extract_error_code(&debug_str) {
        return classify_aws_error(Some(&code), Some(&debug_str));
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

/// Ignore "not found" errors, passing everything else through.
///
/// Teardown paths use this: a resource that is already gone is the outcome
/// they were after.
pub fn ignore_not_found(result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Err(e) if classify_anyhow_error(&e).is_not_found() => Ok(()),
        other => other,
    }
}

/// All known AWS error codes for extraction from debug strings (flat list)
const ALL_KNOWN_CODES: &[&str] = &[
    // Not found
    "InvalidInstanceID.NotFound",
    "InvalidAllocationID.NotFound",
    "InvalidAssociationID.NotFound",
    "InvalidAddress.NotFound",
    "InvalidSpotInstanceRequestID.NotFound",
    "InvalidSubnetID.NotFound",
    // Throttling
    "ThrottlingException",
    "Throttling",
    "RequestLimitExceeded",
    // Capacity
    "InsufficientInstanceCapacity",
    "InsufficientHostCapacity",
    "InsufficientCapacity",
    "MaxSpotInstanceCountExceeded",
    // Limits
    "InstanceLimitExceeded",
    "VcpuLimitExceeded",
    // Unsupported
    "UnsupportedOperation",
    "Unsupported",
];

/// Extract an AWS error code from a debug string representation
fn extract_error_code(debug_str: &str) -> Option<String> {
    for code in ALL_KNOWN_CODES {
        if debug_str.contains(code) {
            return Some((*code).to_string());
        }
    }

    if debug_str.contains("InvalidParameterValue") && debug_str.contains("iamInstanceProfile") {
        return Some("InvalidParameterValue".to_string());
    }
    if debug_str.contains("Invalid IAM Instance Profile") {
        return Some("InvalidParameterValue".to_string());
    }

    // Try to extract any code from `code: Some("...")` pattern
    if let Some(start) = debug_str.find("code: Some(\"") {
        let rest = &debug_str[start + 12..];
        if let Some(end) = rest.find('"') {
            return Some(rest[..end].to_string());
        }
    }

    None
}

/// Error code to user-friendly suggestion mapping
const SUGGESTIONS: &[(&str, &str)] = &[
    (
        "InsufficientInstanceCapacity",
        "Add instance types or subnets in other availability zones to the worker.",
    ),
    (
        "InsufficientHostCapacity",
        "Add instance types or subnets in other availability zones to the worker.",
    ),
    (
        "InsufficientCapacity",
        "Add instance types or subnets in other availability zones to the worker.",
    ),
    (
        "InstanceLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "VcpuLimitExceeded",
        "Request a service limit increase via AWS Service Quotas console.",
    ),
    (
        "MaxSpotInstanceCountExceeded",
        "Reduce spot worker count or request a spot limit increase.",
    ),
    (
        "Unsupported",
        "This instance type may not be available in this region/AZ.",
    ),
    (
        "UnsupportedOperation",
        "This instance type may not be available in this region/AZ.",
    ),
    (
        "RequestLimitExceeded",
        "AWS API rate limit hit. The operation will be retried automatically.",
    ),
];

/// Get a user-friendly suggestion for a known error code.
fn suggestion_for_code(code: &str) -> Option<String> {
    SUGGESTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, s)| (*s).to_string())
}
