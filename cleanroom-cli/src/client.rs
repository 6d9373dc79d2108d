//! Dials the Control API's unix control socket (`spec.md` §6), grounded on
//! the prior art's CRI-socket test client connector.

use std::path::{Path, PathBuf};

use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Connects to the Control API listening on `socket_path`, returning a
/// `tonic` channel usable by any generated client stub.
///
/// # Errors
///
/// Returns an error if the endpoint cannot be constructed or the initial
/// connection to the socket fails.
pub async fn connect(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path: PathBuf = socket_path.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { tokio::net::UnixStream::connect(socket_path).await }
        }))
        .await?;
    Ok(channel)
}
