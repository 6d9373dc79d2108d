//! Conversions between `cleanroom_core` domain types and the generated
//! `pb` wire types.

use cleanroom_core::{
    AllowRule, CompiledPolicy, ExecutionInfo, ExecutionStatus, SandboxInfo, SandboxOptions,
    SandboxStatus,
};
use tonic::Status;

use crate::pb;

/// Converts a duration-since-epoch into milliseconds, saturating at `i64::MAX`.
fn unix_ms(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Maps a [`SandboxStatus`] to its `spec.md` §3 lowercase name.
const fn sandbox_status_name(status: SandboxStatus) -> &'static str {
    match status {
        SandboxStatus::Provisioning => "provisioning",
        SandboxStatus::Ready => "ready",
        SandboxStatus::Stopping => "stopping",
        SandboxStatus::Stopped => "stopped",
        SandboxStatus::Failed => "failed",
    }
}

/// Maps an [`ExecutionStatus`] to its `spec.md` §3 lowercase name.
const fn execution_status_name(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Succeeded => "succeeded",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Canceled => "canceled",
        ExecutionStatus::TimedOut => "timed_out",
    }
}

impl From<&SandboxInfo> for pb::Sandbox {
    fn from(info: &SandboxInfo) -> Self {
        Self {
            sandbox_id: info.sandbox_id.clone(),
            backend: info.backend.clone(),
            status: sandbox_status_name(info.status).to_owned(),
            created_at_unix_ms: unix_ms(info.created_at),
            failure: info.failure.clone().unwrap_or_default(),
        }
    }
}

impl From<&ExecutionInfo> for pb::Execution {
    fn from(info: &ExecutionInfo) -> Self {
        Self {
            execution_id: info.execution_id.clone(),
            status: execution_status_name(info.status).to_owned(),
            exit_code: info.exit_code,
        }
    }
}

/// Builds a [`SandboxOptions`] from a request's optional `options` field,
/// falling back to `defaults` for any field omitted by leaving the message
/// unset (proto3 messages default every scalar to its zero value, so a
/// present-but-zeroed field would otherwise silently clamp to the
/// documented minimum via [`SandboxOptions::normalized`]).
pub fn sandbox_options_from_pb(
    options: Option<pb::SandboxOptions>,
    defaults: SandboxOptions,
) -> SandboxOptions {
    let Some(options) = options else {
        return defaults;
    };
    SandboxOptions {
        launch_seconds: if options.launch_seconds == 0 {
            defaults.launch_seconds
        } else {
            options.launch_seconds
        },
        vcpus: if options.vcpus == 0 {
            defaults.vcpus
        } else {
            u8::try_from(options.vcpus).unwrap_or(u8::MAX)
        },
        memory_mib: if options.memory_mib == 0 {
            defaults.memory_mib
        } else {
            options.memory_mib
        },
        guest_port: if options.guest_port == 0 {
            defaults.guest_port
        } else {
            options.guest_port
        },
    }
    .normalized()
}

/// Compiles a wire [`pb::Policy`] into a [`CompiledPolicy`], surfacing
/// validation failures as `INVALID_ARGUMENT` per `spec.md` §7
/// `policy.invalid`.
pub fn compiled_policy_from_pb(policy: pb::Policy) -> Result<CompiledPolicy, Status> {
    let allow = policy
        .allow
        .into_iter()
        .map(|rule| {
            let ports = rule.ports.iter().map(|&p| u16::try_from(p).unwrap_or(0));
            AllowRule::new(rule.host, ports)
                .map_err(|e| Status::invalid_argument(format!("{}: {e}", e.code())))
        })
        .collect::<Result<Vec<_>, Status>>()?;

    CompiledPolicy::compile(policy.version, policy.image_ref, policy.network_default, allow)
        .map_err(|e| Status::invalid_argument(format!("{}: {e}", e.code())))
}

/// Maps a [`cleanroom_core::Error`] to a `tonic::Status`, preserving its
/// stable dotted error code in the message (`spec.md` §7's "machine-readable
/// error code and a one-line explanation").
pub fn status_from_core_error(err: &cleanroom_core::Error) -> Status {
    use cleanroom_core::Error;
    let message = format!("{}: {err}", err.code());
    match err {
        Error::PolicyInvalid(_) => Status::invalid_argument(message),
        Error::SandboxNotFound(_) | Error::ExecutionNotFound(_) => Status::not_found(message),
        Error::SandboxBusy(_) => Status::failed_precondition(message),
        Error::ExecutionCanceled | Error::ExecutionTimedOut => Status::aborted(message),
        _ => Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_options_from_pb_fills_zeroed_fields_from_defaults() {
        let defaults = SandboxOptions {
            launch_seconds: 30,
            vcpus: 2,
            memory_mib: 512,
            guest_port: 10700,
        };
        let options = sandbox_options_from_pb(
            Some(pb::SandboxOptions {
                launch_seconds: 0,
                vcpus: 0,
                memory_mib: 1024,
                guest_port: 0,
            }),
            defaults,
        );
        assert_eq!(options.launch_seconds, 30);
        assert_eq!(options.vcpus, 2);
        assert_eq!(options.memory_mib, 1024);
        assert_eq!(options.guest_port, 10700);
    }

    #[test]
    fn sandbox_options_from_pb_none_uses_defaults_verbatim() {
        let defaults = SandboxOptions {
            launch_seconds: 45,
            vcpus: 4,
            memory_mib: 2048,
            guest_port: 10700,
        };
        let options = sandbox_options_from_pb(None, defaults);
        assert_eq!(options.launch_seconds, 45);
        assert_eq!(options.vcpus, 4);
    }

    #[test]
    fn compiled_policy_from_pb_rejects_unpinned_ref() {
        let err = compiled_policy_from_pb(pb::Policy {
            version: 1,
            image_ref: "ubuntu:latest".to_owned(),
            network_default: "deny".to_owned(),
            allow: vec![],
        })
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn compiled_policy_from_pb_compiles_valid_policy() {
        let image_ref = format!("ghcr.io/x/y@sha256:{}", "a".repeat(64));
        let policy = compiled_policy_from_pb(pb::Policy {
            version: 1,
            image_ref,
            network_default: "deny".to_owned(),
            allow: vec![pb::AllowRule {
                host: "github.com".to_owned(),
                ports: vec![443],
            }],
        })
        .unwrap();
        assert!(policy.permits("github.com", 443));
    }

    #[test]
    fn status_from_core_error_maps_not_found() {
        let err = cleanroom_core::Error::SandboxNotFound("sb-1".to_owned());
        let status = status_from_core_error(&err);
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("sandbox.not_found"));
    }
}
