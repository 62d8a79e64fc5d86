//! Client-side WireGuard configuration.

/// Everything the client configuration is built from.
pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub client_ip: &'a str,
    pub server_public_key: &'a str,
    pub server_address: &'a str,
    pub server_port: u16,
    pub dns_servers: &'a [String],
}

/// Renders the configuration blob handed to the end-user device.
pub fn render_client_config(params: &ClientConfigParams<'_>) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {client_ip}/24\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         Endpoint = {server_address}:{server_port}\n\
         AllowedIPs = 0.0.0.0/0\n\
         PersistentKeepalive = 25\n",
        private_key = params.private_key,
        client_ip = params.client_ip,
        dns = params.dns_servers.join(", "),
        server_public_key = params.server_public_key,
        server_address = params.server_address,
        server_port = params.server_port,
    )
}
