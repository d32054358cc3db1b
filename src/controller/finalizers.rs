//! Finalizer markers for the resources whose deletion needs remote cleanup
//!
//! The kube-rs `finalizer` helper adds the marker on the first reconcile and
//! only removes it after the cleanup closure returned `Ok`, so an object is
//! never purged while its tunnel, route or connection is still live.

/// Held on a VpcNatTunnel until the tunnel is removed from its gateway
pub const TUNNEL_FINALIZER: &str = "tunnel.finalizer.ustc.io";

/// Held on a VpcDns until the DNS route is removed and verified gone
pub const DNS_FINALIZER: &str = "dns.finalizer.ustc.io";

/// Held on a VpcConnection until `delete.sh` ran for a running connection
pub const CONNECTION_FINALIZER: &str = "connection.finalizer.ustc.io";
