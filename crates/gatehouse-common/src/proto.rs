//! Generated gRPC definitions for the tenant directory service.

tonic::include_proto!("gatehouse.v1");
