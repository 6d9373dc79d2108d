//! Git traffic classification for the `/git/<host>/<repo-path>...` route
//! (`spec.md` §4.6).
//!
//! `git-upload-pack` (clone/fetch) is allowed when the target host is on
//! the scope's policy allow-list with port 443; `git-receive-pack` (push)
//! is always denied; anything else under `/git/` is unsupported.

use axum::http::Method;

/// The classified operation for a `/git/<host>/...` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOperation {
    /// `GET .../info/refs?service=git-upload-pack` — the ref-advertisement
    /// half of a clone/fetch.
    UploadPackInfo {
        /// The path segment naming the upstream host.
        host: String,
        /// The repository path, without the `/info/refs` suffix.
        repo_path: String,
    },
    /// `POST .../git-upload-pack` — the pack-negotiation half of a clone/fetch.
    UploadPackService {
        /// The path segment naming the upstream host.
        host: String,
        /// The repository path, without the `/git-upload-pack` suffix.
        repo_path: String,
    },
    /// Any request naming `git-receive-pack` (push), by path or `service=`
    /// query parameter. Always denied.
    ReceivePack,
    /// A `/git/...` subpath that isn't a recognized upload-pack or
    /// receive-pack request.
    Unsupported,
}

/// Classifies a canonicalised `/git/<host>/<repo-path>...` path.
///
/// `path` must already be canonicalised (see [`crate::path::canonicalise_path`])
/// and start with `/git/`.
#[must_use]
pub fn classify(path: &str, query: Option<&str>, method: &Method) -> GitOperation {
    let Some(rest) = path.strip_prefix("/git/") else {
        return GitOperation::Unsupported;
    };
    let Some((host, tail)) = rest.split_once('/') else {
        return GitOperation::Unsupported;
    };
    if host.is_empty() {
        return GitOperation::Unsupported;
    }

    let service_param = query
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("service="))
        })
        .unwrap_or("");

    if let Some(repo_path) = tail.strip_suffix("/info/refs") {
        return match (method, service_param) {
            (&Method::GET, "git-upload-pack") => GitOperation::UploadPackInfo {
                host: host.to_owned(),
                repo_path: repo_path.to_owned(),
            },
            (&Method::GET, "git-receive-pack") => GitOperation::ReceivePack,
            _ => GitOperation::Unsupported,
        };
    }

    if let Some(repo_path) = tail.strip_suffix("/git-upload-pack") {
        return match *method {
            Method::POST => GitOperation::UploadPackService {
                host: host.to_owned(),
                repo_path: repo_path.to_owned(),
            },
            _ => GitOperation::Unsupported,
        };
    }

    if tail.ends_with("/git-receive-pack") || tail == "git-receive-pack" {
        return GitOperation::ReceivePack;
    }

    GitOperation::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_upload_pack_info_refs() {
        let op = classify(
            "/git/github.com/owner/repo.git/info/refs",
            Some("service=git-upload-pack"),
            &Method::GET,
        );
        assert_eq!(
            op,
            GitOperation::UploadPackInfo {
                host: "github.com".to_owned(),
                repo_path: "owner/repo.git".to_owned(),
            }
        );
    }

    #[test]
    fn classifies_upload_pack_service_post() {
        let op = classify(
            "/git/github.com/owner/repo.git/git-upload-pack",
            None,
            &Method::POST,
        );
        assert_eq!(
            op,
            GitOperation::UploadPackService {
                host: "github.com".to_owned(),
                repo_path: "owner/repo.git".to_owned(),
            }
        );
    }

    #[test]
    fn receive_pack_is_always_classified_as_such() {
        assert_eq!(
            classify(
                "/git/github.com/owner/repo.git/info/refs",
                Some("service=git-receive-pack"),
                &Method::GET,
            ),
            GitOperation::ReceivePack
        );
        assert_eq!(
            classify(
                "/git/github.com/owner/repo.git/git-receive-pack",
                None,
                &Method::POST,
            ),
            GitOperation::ReceivePack
        );
    }

    #[test]
    fn unrecognized_subpath_is_unsupported() {
        assert_eq!(
            classify("/git/github.com/owner/repo.git/HEAD", None, &Method::GET),
            GitOperation::Unsupported
        );
    }
}
