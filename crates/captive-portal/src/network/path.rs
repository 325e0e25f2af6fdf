//! Path and egress-port selection shared by rule installation and redirection

use crate::controller::TopologyOracle;
use crate::error::{Error, Result};
use crate::models::{ConnectPoint, Path, PortNumber};

/// Choose a path whose first hop does not leave through `in_port`
///
/// Empty paths are ignored. When every candidate loops back through the
/// inbound port the last one examined is returned anyway.
pub fn select_path(paths: &[Path], in_port: PortNumber) -> Option<&Path> {
    let mut last = None;
    for path in paths {
        let Some(first) = path.first() else {
            continue;
        };
        if first.src.port != in_port {
            return Some(path);
        }
        last = Some(path);
    }
    last
}

/// Port on `receiver.device` that leads toward `destination`
///
/// Fails with [`Error::NoPathFound`] when the destination sits behind the
/// inbound port itself or when the topology has no path.
pub fn egress_port(
    topology: &dyn TopologyOracle,
    receiver: &ConnectPoint,
    destination: &ConnectPoint,
) -> Result<PortNumber> {
    let no_path = || Error::NoPathFound {
        from: receiver.device.clone(),
        to: destination.device.clone(),
    };

    if receiver.device == destination.device {
        return if destination.port == receiver.port {
            Err(no_path())
        } else {
            Ok(destination.port)
        };
    }

    let paths = topology.paths(&receiver.device, &destination.device);
    select_path(&paths, receiver.port)
        .and_then(Path::first)
        .map(|link| link.src.port)
        .ok_or_else(no_path)
}
