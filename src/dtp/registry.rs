use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;

use crate::error::{DtpError, Result};
use crate::nn::{
    Block, Conv2d, ConvTranspose2d, Elu, Identity, Layer, Linear, MaxPool2d, MaxUnpool2d,
    Normalize, Relu, Reshape, Tanh,
};

/// Builds the inverse of a layer. The registry is passed along so that
/// containers can invert their children.
pub type InvertFn = Box<
    dyn Fn(&dyn Layer, &InversionRegistry, &mut StdRng) -> Result<Box<dyn Layer>> + Send + Sync,
>;

/// Maps a forward layer type to the constructor of its structural inverse.
///
/// New layer kinds are added with [`InversionRegistry::register`]. Every
/// inverse gets freshly initialised parameters.
pub struct InversionRegistry {
    table: HashMap<TypeId, (&'static str, InvertFn)>,
}

impl fmt::Debug for InversionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.table.values().map(|(name, _)| *name).collect();
        kinds.sort_unstable();
        f.debug_struct("InversionRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for InversionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl InversionRegistry {
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    pub fn with_defaults() -> Self {
        let mut reg = Self::empty();
        reg.register::<Linear>("Linear", |l, _, rng| {
            Ok(Box::new(Linear::new(l.out_dim(), l.in_dim(), false, rng)))
        });
        reg.register::<Conv2d>("Conv2d", invert_conv2d);
        reg.register::<ConvTranspose2d>("ConvTranspose2d", invert_conv_transpose2d);
        reg.register::<MaxPool2d>("MaxPool2d", |l, _, _| {
            Ok(Box::new(MaxUnpool2d::new(
                to3(l.output_shape())?,
                to3(l.input_shape())?,
                l.kernel_size(),
                l.stride(),
            )?))
        });
        reg.register::<MaxUnpool2d>("MaxUnpool2d", |l, _, _| {
            Ok(Box::new(MaxPool2d::new(to3(l.output_shape())?, l.kernel_size(), l.stride())?))
        });
        reg.register::<Reshape>("Reshape", |l, _, _| {
            Ok(Box::new(Reshape::new(l.output_shape(), l.input_shape())?))
        });
        reg.register::<Relu>("ReLU", |l, _, _| Ok(Box::new(Identity::new(l.shape()))));
        reg.register::<Elu>("ELU", |l, _, _| Ok(Box::new(Elu::new(l.shape(), l.alpha()))));
        reg.register::<Tanh>("Tanh", |l, _, _| Ok(Box::new(Identity::new(l.shape()))));
        reg.register::<Identity>("Identity", |l, _, _| Ok(Box::new(Identity::new(l.shape()))));
        reg.register::<Normalize>("Normalize", |l, _, _| {
            Ok(Box::new(Identity::new(l.output_shape())))
        });
        reg.register::<Block>("Block", invert_block);
        reg
    }

    /// Registers (or replaces) the inverse constructor for layers of type `L`.
    pub fn register<L: Layer>(
        &mut self,
        name: &'static str,
        invert: impl Fn(&L, &InversionRegistry, &mut StdRng) -> Result<Box<dyn Layer>>
            + Send
            + Sync
            + 'static,
    ) {
        let f: InvertFn =
            Box::new(move |layer: &dyn Layer, reg: &InversionRegistry, rng: &mut StdRng| {
                let layer = layer.as_any().downcast_ref::<L>().ok_or_else(|| {
                    DtpError::InternalConsistency(format!(
                        "inverse of {name} dispatched on a {}",
                        layer.name()
                    ))
                })?;
                invert(layer, reg, rng)
            });
        self.table.insert(TypeId::of::<L>(), (name, f));
    }

    pub fn contains(&self, layer: &dyn Layer) -> bool {
        self.table.contains_key(&layer.as_any().type_id())
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Builds the inverse of `layer`: its input shape is the output shape of
    /// `layer` and the other way round.
    pub fn invert(&self, layer: &dyn Layer, rng: &mut StdRng) -> Result<Box<dyn Layer>> {
        let (_, f) = self
            .table
            .get(&layer.as_any().type_id())
            .ok_or_else(|| DtpError::UnsupportedLayerKind(layer.name().to_string()))?;
        f(layer, self, rng)
    }
}

fn to3(shape: &[usize]) -> Result<[usize; 3]> {
    shape
        .try_into()
        .map_err(|_| DtpError::shape("image layer", &[0, 0, 0], shape))
}

/// Output padding of a transposed conv so that it maps `out` back onto `size`.
fn output_padding(
    size: usize,
    out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize> {
    let base = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(2 * padding);
    size.checked_sub(base).ok_or_else(|| {
        DtpError::InternalConsistency(format!(
            "transposed conv of kernel {kernel}, stride {stride} and padding {padding} \
             overshoots size {size}"
        ))
    })
}

fn invert_conv2d(conv: &Conv2d, _: &InversionRegistry, rng: &mut StdRng) -> Result<Box<dyn Layer>> {
    let input = to3(conv.input_shape())?;
    let output = to3(conv.output_shape())?;
    let (k, s, p) = (conv.kernel_size(), conv.stride(), conv.padding());
    let op = [
        output_padding(input[1], output[1], k[0], s[0], p[0])?,
        output_padding(input[2], output[2], k[1], s[1], p[1])?,
    ];
    Ok(Box::new(ConvTranspose2d::new(output, input[0], k, s, p, op, conv.has_bias(), rng)?))
}

fn invert_conv_transpose2d(
    conv: &ConvTranspose2d,
    _: &InversionRegistry,
    rng: &mut StdRng,
) -> Result<Box<dyn Layer>> {
    let input = to3(conv.input_shape())?;
    let output = to3(conv.output_shape())?;
    Ok(Box::new(Conv2d::new(
        output,
        input[0],
        conv.kernel_size(),
        conv.stride(),
        conv.padding(),
        conv.has_bias(),
        rng,
    )?))
}

fn invert_block(
    block: &Block,
    reg: &InversionRegistry,
    rng: &mut StdRng,
) -> Result<Box<dyn Layer>> {
    let mut inverted = Vec::with_capacity(block.len());
    for child in block.children().iter().rev() {
        inverted.push(reg.invert(child.as_ref(), rng)?);
    }
    if block.is_mirrored() {
        Ok(Box::new(Block::new(inverted)?))
    } else {
        Ok(Box::new(Block::mirrored(inverted)?))
    }
}
