pub mod collab;
pub mod errors;
pub mod export;
pub mod layers;
pub mod naming;
pub mod project;
pub mod publish;
pub mod rest;
pub mod servers;
