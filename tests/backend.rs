//! Backend selection lifecycle, in its own process so nothing else has
//! configured the backend before the first assertion runs.

use revgrad::{backend, Device, Graph, RevgradError};

#[test]
fn backend_must_be_selected_before_graph_construction() {
    assert!(matches!(
        backend::current(),
        Err(RevgradError::BackendUnconfigured)
    ));
    assert!(matches!(
        Graph::new(),
        Err(RevgradError::BackendUnconfigured)
    ));

    backend::select(Device::Cpu).unwrap();
    assert_eq!(backend::current().unwrap(), Device::Cpu);

    let graph = Graph::new().unwrap();
    assert_eq!(graph.device(), Device::Cpu);
    let x = graph.scalar(1.0);
    assert_eq!(x.shape(), Vec::<usize>::new());
}
