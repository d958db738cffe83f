//! Everything that leaves the process: graph files and save states

pub mod graph;
pub mod state;

pub use graph::{create_output, write_dot, write_graph_json};
pub use state::{
    reload_states, save_state, split_reload_list, SavedState, Scaling, StateReloader, EDGE_SCALE_POINT,
    FUNC_SCALE_POINT, STATE_VERSION,
};
