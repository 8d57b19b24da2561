//! Wire messages and client for the `ingress.dataplane.ConfigStream` service, generated from
//! `proto/dataplane.proto`.
//!
//! Configurations and operation payloads are carried as JSON.

tonic::include_proto!("ingress.dataplane");
