pub mod count_io;
pub mod feature_encoder;
pub mod nb_vae_config;
pub mod nb_vae_guided;
pub mod nb_vae_module;
pub mod nb_vae_networks;
pub mod posterior;
pub mod simulate;
