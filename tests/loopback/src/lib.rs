//! End-to-end scenarios: two sessions exchanging files over the in-memory
//! network.

pub mod harness;

#[cfg(test)]
mod quality;
#[cfg(test)]
mod recovery;
#[cfg(test)]
mod transfer;
