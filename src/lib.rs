pub mod config;
pub mod error;
pub mod state;
pub mod db;

pub mod crypto {
    pub mod aes;
    pub mod keypair;
}

pub mod models {
    pub mod session;
    pub mod vpn_session;
}

pub mod repositories {
    pub mod vpn_session;
    pub mod memory;
}

pub mod services {
    pub mod admission;
    pub mod audit;
    pub mod config_renderer;
    pub mod ip_allocator;
    pub mod key_manager;
    pub mod peer_registrar;
    pub mod vpn;
}

pub mod handlers {
    pub mod vpn;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}
