use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    #[default]
    MaxProjection,
    Compositing,
    TestProjection,
}

impl RenderMode {
    pub fn kernel(self) -> Kernel {
        match self {
            RenderMode::MaxProjection => Kernel::MaxProjectShort,
            RenderMode::Compositing => Kernel::CompositingRender,
            RenderMode::TestProjection => Kernel::TestProjection,
        }
    }

    pub fn family(self) -> KernelFamily {
        self.kernel().family()
    }
}

/// Kernel entry points. The names are a fixed contract with the shader source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    MaxProjectShort,
    CompositingRender,
    TestProjection,
}

impl Kernel {
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::MaxProjectShort => "max_projectShort",
            Kernel::CompositingRender => "compositing_render",
            Kernel::TestProjection => "test_projection",
        }
    }

    pub fn family(self) -> KernelFamily {
        match self {
            Kernel::MaxProjectShort | Kernel::TestProjection => KernelFamily::Transposing,
            Kernel::CompositingRender => KernelFamily::Inverting,
        }
    }

    pub const ALL: [Kernel; 3] = [
        Kernel::MaxProjectShort,
        Kernel::CompositingRender,
        Kernel::TestProjection,
    ];
}

/// How a kernel turns the composed modelview into a view-to-model mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFamily {
    /// 3x4 transpose of the modelview, orthographic rays.
    Transposing,
    /// Full 4x4 inverse, perspective capable.
    Inverting,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    CPU,
    #[default]
    GPU,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
