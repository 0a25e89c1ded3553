use owo_colors::{OwoColorize, Style as OwoStyle};

/// What a piece of report text stands for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Tone {
    Heading,
    /// A state a component moved into.
    State,
    /// A message that left the core.
    Delivery,
    /// Field names, step numbers and flags.
    Label,
    /// Rule names, step descriptions and other values worth spotting.
    Name,
}

impl Tone {
    fn style(self) -> OwoStyle {
        match self {
            Self::Heading => OwoStyle::new().bold().cyan(),
            Self::State => OwoStyle::new().bold().green(),
            Self::Delivery => OwoStyle::new().bold().yellow(),
            Self::Label => OwoStyle::new().dimmed(),
            Self::Name => OwoStyle::new().bold(),
        }
    }
}

/// Colours report text when stdout is a terminal.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn paint(&self, tone: Tone, text: impl AsRef<str>) -> String {
        let text = text.as_ref();
        if self.use_colour {
            text.style(tone.style()).to_string()
        } else {
            text.to_owned()
        }
    }

    pub(crate) fn heading(&self, text: impl AsRef<str>) -> String {
        self.paint(Tone::Heading, text)
    }

    pub(crate) fn state(&self, text: impl AsRef<str>) -> String {
        self.paint(Tone::State, text)
    }

    pub(crate) fn delivery(&self, text: impl AsRef<str>) -> String {
        self.paint(Tone::Delivery, text)
    }

    pub(crate) fn label(&self, text: impl AsRef<str>) -> String {
        self.paint(Tone::Label, text)
    }

    pub(crate) fn name(&self, text: impl AsRef<str>) -> String {
        self.paint(Tone::Name, text)
    }
}
