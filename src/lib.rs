//! # Guild Music
//!
//! Núcleo de reproducción de música por guild para un bot de Discord: cola,
//! votos de skip, loop, autoplay y orquestación de nodos Lavalink.
//!
//! - [`audio`] - sesiones, cola, pool de nodos y router de eventos
//! - [`sources`] - resolución de búsquedas y URLs a tracks
//! - [`bot`] - handler del gateway y superficie de comandos
//! - [`storage`] - configuración persistente por guild (JSON)

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod presence;
pub mod sources;
pub mod storage;
