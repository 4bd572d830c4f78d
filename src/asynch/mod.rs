pub mod control;
pub mod resources;
pub mod runner;
pub(crate) mod state;
mod urc_handler;

use embedded_io_async::Write;

pub use control::Control;
pub use resources::Resources;
pub use runner::Runner;

use crate::config::ModemConfig;
use crate::ingress::Ingress;
use crate::modules::Module;

/// Split the engine into its three cooperating pieces:
///
/// - [`Ingress`] is fed by the transport (or drives a reader via
///   [`Ingress::read_from`]),
/// - [`Runner`] is the sequencer; `run()` it in a dedicated task,
/// - [`Control`] is the cloneable application handle.
///
/// Events are subscribed separately through [`Resources::events`].
pub fn new<'a, W: Write, C: ModemConfig, const EVENT_CAP: usize, const EVENT_SUBS: usize>(
    resources: &'a Resources<EVENT_CAP, EVENT_SUBS>,
    module: Module,
    config: C,
    tx: W,
) -> (Ingress<'a>, Runner<'a, W, C>, Control<'a>) {
    let ingress = Ingress::new(resources.lines.sender());
    let runner = Runner::new(resources, module, config, tx);
    let control = Control::new(resources);
    (ingress, runner, control)
}
