//! Bindings generated from `proto/pacemaker.proto` at build time.

tonic::include_proto!("pacemaker.v1");
