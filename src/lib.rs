// village - CNI plugin attaching containers to a host bridge and an optional macvlan

pub mod cni;
pub mod ctrl;
pub mod network;
pub mod orchestrator;
