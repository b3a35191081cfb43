//! The seam between the device-independent core and a concrete cable.
//!
//! A cable driver turns a compiled [`TemplateStrings`] into whatever wire
//! command stream its hardware wants, then moves bits. The core owns
//! everything else: templates, string compilation, TDI splicing and TDO
//! extraction. Drivers implement this trait; templates hold a shared
//! handle to the driver rather than inheriting from it.

use crate::xstring::{BitString, TemplateStrings, XString};
use crate::JtagError;

pub trait Transport {
    /// Opaque per-template artifact, built once and replayed many times.
    type Compiled;

    /// Rewrite the TDI/TDO strings before they are finalized.
    ///
    /// This is where a driver interleaves protocol framing: command bytes
    /// spliced into the TDI string, matching don't-care spacers into the
    /// TDO string. The two strings must come back equal in length with
    /// every placeholder (`x`) position preserved; most cables need no
    /// framing and keep the default pass-through.
    fn customize_template(&mut self, tdi: XString, tdo: XString) -> (XString, XString) {
        (tdi, tdo)
    }

    /// Build the reusable device-specific artifact for one template.
    fn make_template(&mut self, strings: &TemplateStrings) -> Result<Self::Compiled, JtagError>;

    /// Perform one physical transfer.
    ///
    /// `tdi` is the fully concrete wire-order drive string for this
    /// invocation (same length as the customized TDI template). The
    /// returned capture must be wire-ordered and of the customized TDO
    /// string's length; it is only examined when the template registered
    /// captures.
    fn apply_template(
        &mut self,
        compiled: &Self::Compiled,
        tdi: &BitString,
    ) -> Result<BitString, JtagError>;
}
