pub use memory::MemoryDb;
pub use simulated::SimulatedChain;

mod memory;
mod simulated;
